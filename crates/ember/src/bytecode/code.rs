//! Code objects: immutable compiled function bodies.
//!
//! A [`Code`] holds bytecode plus the tables its operands index into. It is validated once
//! at construction, so the dispatch loop can trust operand indices and jump targets, and
//! it is shared by every frame, function and generator created from it.

use std::{
    fmt::{self, Write as _},
    hash::{Hash, Hasher},
    rc::Rc,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

use super::{
    op::{CompareOp, InvalidOpcodeError, MakeFunctionFlags, Opcode, OperandKind},
    stack_depth,
};
use crate::cell::CellFamily;

/// Bit flags describing how a code object runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// Locals live in fast slots rather than a name-keyed map.
    pub const OPTIMIZED: Self = Self(0x0001);
    /// A fresh locals namespace is created for each frame.
    pub const NEWLOCALS: Self = Self(0x0002);
    /// Collects extra positional arguments into a tuple.
    pub const VARARGS: Self = Self(0x0004);
    /// Collects extra keyword arguments into a dict.
    pub const VARKEYWORDS: Self = Self(0x0008);
    pub const NESTED: Self = Self(0x0010);
    pub const GENERATOR: Self = Self(0x0020);
    pub const COROUTINE: Self = Self(0x0080);
    /// A generator that may also be awaited.
    pub const ITERABLE_COROUTINE: Self = Self(0x0100);
    pub const ASYNC_GENERATOR: Self = Self(0x0200);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Whether calling this code produces a suspendable object instead of running it.
    #[must_use]
    pub const fn is_generator_like(self) -> bool {
        self.0 & (Self::GENERATOR.0 | Self::COROUTINE.0 | Self::ASYNC_GENERATOR.0) != 0
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A compile-time constant.
///
/// Equality and hashing are kind-aware: `1`, `1.0` and `True` are three distinct constants,
/// floats compare by bit pattern (so `0.0` and `-0.0` differ), and strings never equal bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Constant {
    None,
    Ellipsis,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Constant]>),
    Code(Rc<Code>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::None | Self::Ellipsis => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Tuple(items) => items.hash(state),
            Self::Code(code) => code.hash(state),
        }
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Constant {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Constant {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<Code> for Constant {
    fn from(value: Code) -> Self {
        Self::Code(Rc::new(value))
    }
}

/// Source position of the instructions starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
}

/// Everything needed to build a [`Code`]; the serialized form of a code object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeParts {
    pub name: Rc<str>,
    pub qualname: Rc<str>,
    pub filename: Rc<str>,
    pub first_line: u32,
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub bytecode: Vec<u8>,
    pub constants: Vec<Constant>,
    pub names: Vec<Rc<str>>,
    pub varnames: Vec<Rc<str>>,
    pub cellvars: Vec<Rc<str>>,
    pub freevars: Vec<Rc<str>>,
    /// Sorted by offset.
    pub locations: Vec<Location>,
}

/// Reasons a code object is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    ArgCounts {
        posonlyargcount: u32,
        argcount: u32,
        kwonlyargcount: u32,
        nlocals: u32,
    },
    LocalCount {
        nlocals: u32,
        varnames: usize,
    },
    CellIsAlsoFree(Rc<str>),
    OddLength(usize),
    InvalidOpcode {
        offset: usize,
        byte: u8,
    },
    DanglingExtendedArg {
        offset: usize,
    },
    OperandOutOfRange {
        offset: usize,
        opcode: Opcode,
        arg: u32,
    },
    JumpOutOfRange {
        offset: usize,
        target: usize,
    },
    InconsistentStackDepth {
        offset: usize,
        expected: i32,
        found: i32,
    },
    StackUnderflow {
        offset: usize,
    },
    StackTooSmall {
        declared: u32,
        required: u32,
    },
    Decode(String),
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArgCounts {
                posonlyargcount,
                argcount,
                kwonlyargcount,
                nlocals,
            } => write!(
                f,
                "invalid argument counts: {posonlyargcount} positional-only, {argcount} positional, \
                 {kwonlyargcount} keyword-only for {nlocals} locals"
            ),
            Self::LocalCount { nlocals, varnames } => {
                write!(f, "nlocals is {nlocals} but {varnames} variable names were given")
            }
            Self::CellIsAlsoFree(name) => write!(f, "'{name}' is both a cell and a free variable"),
            Self::OddLength(len) => write!(f, "bytecode length {len} is not a multiple of 2"),
            Self::InvalidOpcode { offset, byte } => {
                write!(f, "{} at offset {offset}", InvalidOpcodeError(*byte))
            }
            Self::DanglingExtendedArg { offset } => {
                write!(f, "ExtendedArg at offset {offset} does not prefix an instruction")
            }
            Self::OperandOutOfRange { offset, opcode, arg } => {
                write!(f, "operand {arg} of {opcode} at offset {offset} is out of range")
            }
            Self::JumpOutOfRange { offset, target } => {
                write!(f, "jump at offset {offset} targets invalid offset {target}")
            }
            Self::InconsistentStackDepth {
                offset,
                expected,
                found,
            } => write!(
                f,
                "stack depth at offset {offset} is {found} on one path and {expected} on another"
            ),
            Self::StackUnderflow { offset } => write!(f, "operand stack underflows at offset {offset}"),
            Self::StackTooSmall { declared, required } => {
                write!(f, "declared stack size {declared} is below the required {required}")
            }
            Self::Decode(msg) => write!(f, "failed to decode code object: {msg}"),
        }
    }
}

impl std::error::Error for CodeError {}

/// One decoded instruction, with any `ExtendedArg` prefixes folded into `arg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the first unit, including prefixes.
    pub start: usize,
    /// Offset of the opcode itself.
    pub offset: usize,
    pub opcode: Opcode,
    pub arg: u32,
}

impl Instruction {
    /// Offset of the following instruction.
    #[must_use]
    pub fn next(&self) -> usize {
        self.offset + 2
    }

    /// Where this instruction's jump lands, if it has one.
    #[must_use]
    pub fn jump_target(&self) -> Option<usize> {
        match self.opcode.operand_kind() {
            OperandKind::Jump => Some(self.arg as usize),
            OperandKind::RelativeJump => Some(self.next() + self.arg as usize),
            _ => None,
        }
    }
}

/// Decodes a whole instruction stream, checking only that it is well formed.
pub(crate) fn decode(bytecode: &[u8]) -> Result<Vec<Instruction>, CodeError> {
    if bytecode.len() % 2 != 0 {
        return Err(CodeError::OddLength(bytecode.len()));
    }
    let mut instructions = Vec::with_capacity(bytecode.len() / 2);
    let mut extended: u32 = 0;
    let mut start = None;
    for (index, unit) in bytecode.chunks_exact(2).enumerate() {
        let offset = index * 2;
        let opcode = Opcode::try_from(unit[0]).map_err(|InvalidOpcodeError(byte)| CodeError::InvalidOpcode { offset, byte })?;
        let arg = (extended << 8) | u32::from(unit[1]);
        if opcode == Opcode::ExtendedArg {
            start.get_or_insert(offset);
            extended = arg;
            continue;
        }
        instructions.push(Instruction {
            start: start.take().unwrap_or(offset),
            offset,
            opcode,
            arg: if opcode.has_arg() { arg } else { 0 },
        });
        extended = 0;
    }
    if let Some(offset) = start {
        return Err(CodeError::DanglingExtendedArg { offset });
    }
    Ok(instructions)
}

/// An immutable, validated code object.
pub struct Code {
    parts: CodeParts,
    /// For each cell variable, the argument slot whose value seeds it.
    cell2arg: Vec<Option<u32>>,
    cell_families: Vec<Rc<CellFamily>>,
}

impl Code {
    /// Validates `parts` and derives the cell bookkeeping.
    pub fn new(parts: CodeParts) -> Result<Self, CodeError> {
        let varargs = u32::from(parts.flags.contains(CodeFlags::VARARGS));
        let varkw = u32::from(parts.flags.contains(CodeFlags::VARKEYWORDS));
        let total_args = u64::from(parts.argcount) + u64::from(parts.kwonlyargcount) + u64::from(varargs + varkw);
        if parts.posonlyargcount > parts.argcount || total_args > u64::from(parts.nlocals) {
            return Err(CodeError::ArgCounts {
                posonlyargcount: parts.posonlyargcount,
                argcount: parts.argcount,
                kwonlyargcount: parts.kwonlyargcount,
                nlocals: parts.nlocals,
            });
        }
        if parts.varnames.len() != parts.nlocals as usize {
            return Err(CodeError::LocalCount {
                nlocals: parts.nlocals,
                varnames: parts.varnames.len(),
            });
        }
        if let Some(name) = parts.cellvars.iter().find(|name| parts.freevars.contains(name)) {
            return Err(CodeError::CellIsAlsoFree(name.clone()));
        }

        let instructions = decode(&parts.bytecode)?;
        validate_operands(&parts, &instructions)?;
        let required = stack_depth::max_depth(&instructions)?;
        if required > parts.stacksize {
            return Err(CodeError::StackTooSmall {
                declared: parts.stacksize,
                required,
            });
        }

        let arg_slots = (total_args as usize).min(parts.varnames.len());
        let cell2arg = parts
            .cellvars
            .iter()
            .map(|cell| {
                parts.varnames[..arg_slots]
                    .iter()
                    .position(|var| var == cell)
                    .map(|slot| slot as u32)
            })
            .collect();
        let cell_families = parts
            .cellvars
            .iter()
            .map(|name| Rc::new(CellFamily::new(name.clone())))
            .collect();
        Ok(Self {
            parts,
            cell2arg,
            cell_families,
        })
    }

    #[must_use]
    pub fn name(&self) -> &Rc<str> {
        &self.parts.name
    }

    #[must_use]
    pub fn qualname(&self) -> &Rc<str> {
        &self.parts.qualname
    }

    #[must_use]
    pub fn filename(&self) -> &Rc<str> {
        &self.parts.filename
    }

    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.parts.first_line
    }

    #[must_use]
    pub fn argcount(&self) -> usize {
        self.parts.argcount as usize
    }

    #[must_use]
    pub fn posonlyargcount(&self) -> usize {
        self.parts.posonlyargcount as usize
    }

    #[must_use]
    pub fn kwonlyargcount(&self) -> usize {
        self.parts.kwonlyargcount as usize
    }

    #[must_use]
    pub fn nlocals(&self) -> usize {
        self.parts.nlocals as usize
    }

    #[must_use]
    pub fn stacksize(&self) -> usize {
        self.parts.stacksize as usize
    }

    #[must_use]
    pub fn flags(&self) -> CodeFlags {
        self.parts.flags
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.parts.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.parts.constants
    }

    #[must_use]
    pub fn names(&self) -> &[Rc<str>] {
        &self.parts.names
    }

    #[must_use]
    pub fn varnames(&self) -> &[Rc<str>] {
        &self.parts.varnames
    }

    #[must_use]
    pub fn cellvars(&self) -> &[Rc<str>] {
        &self.parts.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[Rc<str>] {
        &self.parts.freevars
    }

    #[must_use]
    pub fn locations(&self) -> &[Location] {
        &self.parts.locations
    }

    #[must_use]
    pub fn parts(&self) -> &CodeParts {
        &self.parts
    }

    #[must_use]
    pub fn ncells(&self) -> usize {
        self.parts.cellvars.len()
    }

    #[must_use]
    pub fn nfrees(&self) -> usize {
        self.parts.freevars.len()
    }

    /// Name of cell/free slot `index`: cells first, then frees.
    #[must_use]
    pub fn deref_name(&self, index: usize) -> &Rc<str> {
        let ncells = self.ncells();
        if index < ncells {
            &self.parts.cellvars[index]
        } else {
            &self.parts.freevars[index - ncells]
        }
    }

    #[must_use]
    pub fn cell2arg(&self) -> &[Option<u32>] {
        &self.cell2arg
    }

    #[must_use]
    pub fn cell_family(&self, index: usize) -> &Rc<CellFamily> {
        &self.cell_families[index]
    }

    /// Whether the cell variable `name` was ever rebound in any frame of this code.
    #[must_use]
    pub fn cell_ever_rebound(&self, name: &str) -> Option<bool> {
        let index = self.parts.cellvars.iter().position(|cell| &**cell == name)?;
        Some(self.cell_families[index].ever_rebound())
    }

    #[must_use]
    pub fn has_varargs(&self) -> bool {
        self.parts.flags.contains(CodeFlags::VARARGS)
    }

    #[must_use]
    pub fn has_varkeywords(&self) -> bool {
        self.parts.flags.contains(CodeFlags::VARKEYWORDS)
    }

    /// The location entry covering `offset`.
    #[must_use]
    pub fn location_for(&self, offset: usize) -> Option<Location> {
        let locations = &self.parts.locations;
        let index = locations.partition_point(|loc| loc.offset as usize <= offset);
        index.checked_sub(1).map(|i| locations[i])
    }

    /// Source line for `offset`, falling back to the first line.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> u32 {
        self.location_for(offset).map_or(self.parts.first_line, |loc| loc.line)
    }

    /// Decoded instructions. The stream was validated at construction.
    #[must_use]
    pub fn instructions(&self) -> Vec<Instruction> {
        decode(&self.parts.bytecode).unwrap_or_default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decodes a code object, re-running every construction check.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodeError> {
        postcard::from_bytes(bytes).map_err(|err| CodeError::Decode(err.to_string()))
    }

    /// Human-readable listing, one instruction per line.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut last_line = None;
        for ins in self.instructions() {
            let line = self.location_for(ins.offset).map(|loc| loc.line);
            if line != last_line {
                let _ = write!(out, "{:>4} ", line.map_or_else(String::new, |l| l.to_string()));
                last_line = line;
            } else {
                out.push_str("     ");
            }
            let _ = write!(out, "{:>6} {:<20}", ins.offset, ins.opcode.to_string());
            if ins.opcode.has_arg() {
                let _ = write!(out, " {:>4}", ins.arg);
                if let Some(detail) = self.describe_arg(&ins) {
                    let _ = write!(out, " ({detail})");
                }
            }
            out.truncate(out.trim_end().len());
            out.push('\n');
        }
        out
    }

    fn describe_arg(&self, ins: &Instruction) -> Option<String> {
        let arg = ins.arg as usize;
        match ins.opcode.operand_kind() {
            OperandKind::Const => Some(match &self.parts.constants[arg] {
                Constant::Code(code) => format!("<code object {}>", code.name()),
                Constant::Str(s) => format!("{s:?}"),
                other => format!("{other:?}"),
            }),
            OperandKind::Local => Some(self.parts.varnames[arg].to_string()),
            OperandKind::Name => Some(self.parts.names[arg].to_string()),
            OperandKind::Deref => Some(self.deref_name(arg).to_string()),
            OperandKind::RelativeJump => ins.jump_target().map(|target| format!("to {target}")),
            OperandKind::Compare => CompareOp::from_repr(ins.arg as u8).map(|op| op.to_string()),
            _ => None,
        }
    }
}

fn validate_operands(parts: &CodeParts, instructions: &[Instruction]) -> Result<(), CodeError> {
    let len = parts.bytecode.len();
    let nderefs = parts.cellvars.len() + parts.freevars.len();
    for ins in instructions {
        let arg = ins.arg as usize;
        let in_range = match ins.opcode.operand_kind() {
            OperandKind::None | OperandKind::Count | OperandKind::Extended => true,
            OperandKind::Const => arg < parts.constants.len(),
            OperandKind::Local => arg < parts.varnames.len(),
            OperandKind::Name => arg < parts.names.len(),
            OperandKind::Deref => arg < nderefs,
            OperandKind::Compare => ins.arg <= u32::from(u8::MAX) && CompareOp::from_repr(ins.arg as u8).is_some(),
            OperandKind::Raise => arg <= 2,
            OperandKind::FunctionFlags => ins.arg & !MakeFunctionFlags::ALL == 0,
            OperandKind::AsyncFlag => arg <= 1,
            OperandKind::Jump | OperandKind::RelativeJump => {
                let target = ins.jump_target().unwrap_or(usize::MAX);
                if target >= len || target % 2 != 0 {
                    return Err(CodeError::JumpOutOfRange {
                        offset: ins.offset,
                        target,
                    });
                }
                true
            }
        };
        if !in_range {
            return Err(CodeError::OperandOutOfRange {
                offset: ins.offset,
                opcode: ins.opcode,
                arg: ins.arg,
            });
        }
    }
    Ok(())
}

impl PartialEq for Code {
    fn eq(&self, other: &Self) -> bool {
        let (a, b) = (&self.parts, &other.parts);
        a.name == b.name
            && a.argcount == b.argcount
            && a.posonlyargcount == b.posonlyargcount
            && a.kwonlyargcount == b.kwonlyargcount
            && a.nlocals == b.nlocals
            && a.flags == b.flags
            && a.first_line == b.first_line
            && a.bytecode == b.bytecode
            && a.constants == b.constants
            && a.names == b.names
            && a.varnames == b.varnames
            && a.cellvars == b.cellvars
            && a.freevars == b.freevars
    }
}

impl Eq for Code {}

impl Hash for Code {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let parts = &self.parts;
        parts.name.hash(state);
        parts.argcount.hash(state);
        parts.flags.hash(state);
        parts.first_line.hash(state);
        parts.bytecode.hash(state);
        parts.constants.hash(state);
        parts.names.hash(state);
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Code")
            .field("name", &self.parts.name)
            .field("filename", &self.parts.filename)
            .field("first_line", &self.parts.first_line)
            .field("flags", &self.parts.flags)
            .field("len", &self.parts.bytecode.len())
            .finish_non_exhaustive()
    }
}

impl Serialize for Code {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.parts.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts = CodeParts::deserialize(deserializer)?;
        Self::new(parts).map_err(D::Error::custom)
    }
}
