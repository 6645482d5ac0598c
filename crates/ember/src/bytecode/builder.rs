//! Builder for assembling code objects.
//!
//! `CodeBuilder` collects instructions with symbolic jump labels and symbolic cell/free
//! slots, then assembles them in [`CodeBuilder::build`]: operands that do not fit in a byte
//! get `ExtendedArg` prefixes, jump targets are resolved once every instruction's final
//! width is known, and the stack size is computed from the finished stream.

use std::rc::Rc;

use super::{
    Opcode,
    code::{Code, CodeError, CodeFlags, CodeParts, Constant, Location},
    op::OperandKind,
    stack_depth,
};

/// A jump target that is bound to an instruction position later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// A cell or free variable slot. Free slots are numbered after all cells, which is only
/// known once the builder is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefSlot {
    Cell(u32),
    Free(u32),
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    Plain(u32),
    Label(Label),
    Deref(DerefSlot),
}

#[derive(Debug)]
struct PendingInstruction {
    opcode: Opcode,
    operand: Operand,
    location: Option<(u32, u32)>,
}

/// Incrementally assembles a [`Code`].
#[derive(Debug)]
pub struct CodeBuilder {
    name: Rc<str>,
    qualname: Option<Rc<str>>,
    filename: Rc<str>,
    first_line: Option<u32>,
    flags: CodeFlags,
    argcount: u32,
    posonlyargcount: u32,
    kwonlyargcount: u32,
    varnames: Vec<Rc<str>>,
    names: Vec<Rc<str>>,
    cellvars: Vec<Rc<str>>,
    freevars: Vec<Rc<str>>,
    constants: Vec<Constant>,
    instructions: Vec<PendingInstruction>,
    /// Instruction index each label is bound to.
    labels: Vec<Option<usize>>,
    location: Option<(u32, u32)>,
}

impl CodeBuilder {
    /// Starts an optimized function body.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            qualname: None,
            filename: "<ember>".into(),
            first_line: None,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            varnames: Vec::new(),
            names: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            constants: Vec::new(),
            instructions: Vec::new(),
            labels: Vec::new(),
            location: None,
        }
    }

    /// Starts a module-level body whose names live in a dict rather than fast slots.
    #[must_use]
    pub fn module(name: &str) -> Self {
        let mut builder = Self::new(name);
        builder.flags = CodeFlags::empty();
        builder
    }

    pub fn set_qualname(&mut self, qualname: &str) -> &mut Self {
        self.qualname = Some(qualname.into());
        self
    }

    pub fn set_filename(&mut self, filename: &str) -> &mut Self {
        self.filename = filename.into();
        self
    }

    pub fn set_first_line(&mut self, line: u32) -> &mut Self {
        self.first_line = Some(line);
        self
    }

    pub fn add_flags(&mut self, flags: CodeFlags) -> &mut Self {
        self.flags.insert(flags);
        self
    }

    /// Declares parameters by name, in slot order: positional (the first `posonly` of them
    /// positional-only), keyword-only, then `*args` and `**kwargs` names when the matching
    /// flags are set.
    pub fn set_params(&mut self, positional: &[&str], posonly: u32, kwonly: &[&str]) -> &mut Self {
        assert!(self.varnames.is_empty(), "parameters must be declared before other locals");
        for name in positional.iter().chain(kwonly) {
            self.local(name);
        }
        self.argcount = positional.len() as u32;
        self.posonlyargcount = posonly;
        self.kwonlyargcount = kwonly.len() as u32;
        self
    }

    /// Marks the function as taking `*name`; call right after [`Self::set_params`].
    pub fn varargs(&mut self, name: &str) -> &mut Self {
        self.flags.insert(CodeFlags::VARARGS);
        self.local(name);
        self
    }

    /// Marks the function as taking `**name`; call after any [`Self::varargs`].
    pub fn varkeywords(&mut self, name: &str) -> &mut Self {
        self.flags.insert(CodeFlags::VARKEYWORDS);
        self.local(name);
        self
    }

    /// Slot of local `name`, declaring it on first use.
    pub fn local(&mut self, name: &str) -> u32 {
        intern(&mut self.varnames, name)
    }

    /// Index of `name` in the names table.
    pub fn name(&mut self, name: &str) -> u32 {
        intern(&mut self.names, name)
    }

    pub fn cell(&mut self, name: &str) -> DerefSlot {
        DerefSlot::Cell(intern(&mut self.cellvars, name))
    }

    pub fn free(&mut self, name: &str) -> DerefSlot {
        DerefSlot::Free(intern(&mut self.freevars, name))
    }

    /// Index of `constant` in the pool; equal constants of the same kind share an entry.
    pub fn constant(&mut self, constant: impl Into<Constant>) -> u32 {
        let constant = constant.into();
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return index as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Source line attached to the instructions emitted from now on.
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.set_location(line, 0)
    }

    pub fn set_location(&mut self, line: u32, column: u32) -> &mut Self {
        self.location = Some((line, column));
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next instruction emitted.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.instructions.len());
        self
    }

    fn push(&mut self, opcode: Opcode, operand: Operand) -> &mut Self {
        self.instructions.push(PendingInstruction {
            opcode,
            operand,
            location: self.location,
        });
        self
    }

    pub fn emit(&mut self, opcode: Opcode) -> &mut Self {
        debug_assert!(!opcode.has_arg(), "{opcode} needs an operand");
        self.push(opcode, Operand::Plain(0))
    }

    pub fn emit_arg(&mut self, opcode: Opcode, arg: u32) -> &mut Self {
        self.push(opcode, Operand::Plain(arg))
    }

    pub fn emit_jump(&mut self, opcode: Opcode, label: Label) -> &mut Self {
        debug_assert!(
            matches!(opcode.operand_kind(), OperandKind::Jump | OperandKind::RelativeJump),
            "{opcode} is not a jump"
        );
        self.push(opcode, Operand::Label(label))
    }

    pub fn emit_deref(&mut self, opcode: Opcode, slot: DerefSlot) -> &mut Self {
        self.push(opcode, Operand::Deref(slot))
    }

    pub fn load_const(&mut self, constant: impl Into<Constant>) -> &mut Self {
        let index = self.constant(constant);
        self.emit_arg(Opcode::LoadConst, index)
    }

    pub fn load_none(&mut self) -> &mut Self {
        self.load_const(Constant::None)
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        let slot = self.local(name);
        self.emit_arg(Opcode::LoadFast, slot)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        let slot = self.local(name);
        self.emit_arg(Opcode::StoreFast, slot)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit_arg(Opcode::LoadGlobal, index)
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit_arg(Opcode::StoreGlobal, index)
    }

    pub fn load_name(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit_arg(Opcode::LoadName, index)
    }

    pub fn store_name(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit_arg(Opcode::StoreName, index)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        let index = self.name(name);
        self.emit_arg(Opcode::LoadAttr, index)
    }

    pub fn call(&mut self, argc: u32) -> &mut Self {
        self.emit_arg(Opcode::CallFunction, argc)
    }

    pub fn return_value(&mut self) -> &mut Self {
        self.emit(Opcode::ReturnValue)
    }

    /// Assembles the instruction stream and validates the result.
    pub fn build(self) -> Result<Code, CodeError> {
        let ncells = self.cellvars.len() as u32;
        let count = self.instructions.len();
        let mut units = vec![1usize; count];
        let mut args = vec![0u32; count];

        // widths only ever grow, so this settles within a few rounds
        loop {
            let mut starts = Vec::with_capacity(count + 1);
            let mut offset = 0;
            for width in &units {
                starts.push(offset);
                offset += width * 2;
            }
            starts.push(offset);

            let mut changed = false;
            for (index, ins) in self.instructions.iter().enumerate() {
                let arg = match ins.operand {
                    Operand::Plain(arg) => arg,
                    Operand::Deref(DerefSlot::Cell(i)) => i,
                    Operand::Deref(DerefSlot::Free(i)) => ncells + i,
                    Operand::Label(label) => {
                        let opcode_offset = starts[index] + (units[index] - 1) * 2;
                        let target = self.labels[label.0].map_or(usize::MAX, |bound| starts[bound]);
                        let resolved = if ins.opcode.operand_kind() == OperandKind::RelativeJump {
                            target.checked_sub(opcode_offset + 2)
                        } else {
                            Some(target)
                        };
                        resolved
                            .and_then(|value| u32::try_from(value).ok())
                            .ok_or(CodeError::JumpOutOfRange {
                                offset: opcode_offset,
                                target,
                            })?
                    }
                };
                args[index] = arg;
                let width = units_for(arg).max(units[index]);
                if width != units[index] {
                    units[index] = width;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut bytecode = Vec::with_capacity(units.iter().sum::<usize>() * 2);
        let mut locations: Vec<Location> = Vec::new();
        for ((ins, &width), &arg) in self.instructions.iter().zip(&units).zip(&args) {
            if let Some((line, column)) = ins.location
                && locations.last().is_none_or(|last| (last.line, last.column) != (line, column))
            {
                locations.push(Location {
                    offset: bytecode.len() as u32,
                    line,
                    column,
                });
            }
            for shift in (1..width).rev() {
                bytecode.push(Opcode::ExtendedArg as u8);
                bytecode.push((arg >> (8 * shift)) as u8);
            }
            bytecode.push(ins.opcode as u8);
            bytecode.push(arg as u8);
        }

        let stacksize = stack_depth::max_stack_depth(&bytecode)?;
        let first_line = self
            .first_line
            .or_else(|| locations.first().map(|loc| loc.line))
            .unwrap_or(1);
        Code::new(CodeParts {
            qualname: self.qualname.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            filename: self.filename,
            first_line,
            argcount: self.argcount,
            posonlyargcount: self.posonlyargcount,
            kwonlyargcount: self.kwonlyargcount,
            nlocals: self.varnames.len() as u32,
            stacksize,
            flags: self.flags,
            bytecode,
            constants: self.constants,
            names: self.names,
            varnames: self.varnames,
            cellvars: self.cellvars,
            freevars: self.freevars,
            locations,
        })
    }
}

fn intern(table: &mut Vec<Rc<str>>, name: &str) -> u32 {
    if let Some(index) = table.iter().position(|existing| &**existing == name) {
        return index as u32;
    }
    table.push(name.into());
    (table.len() - 1) as u32
}

/// Number of two-byte units needed to encode `arg`, including prefixes.
fn units_for(arg: u32) -> usize {
    match arg {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}
