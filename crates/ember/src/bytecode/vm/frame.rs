//! Execution frames.
//!
//! A frame keeps every per-invocation slot in one arena laid out as
//! `[locals][cells][frees][operand stack]`. The operand stack region is sized from the
//! code object's declared stack size, so pushes never reallocate.

use std::{fmt, mem, rc::Rc};

use super::block::{Block, BlockKind};
use crate::{
    bytecode::Code,
    cell::CellRef,
    exception::{ExcType, Exception, RunResult},
    namespace::Namespace,
    value::{DictMap, Value},
};

/// One activation of a code object.
pub struct Frame {
    code: Rc<Code>,
    globals: Namespace,
    builtins: Namespace,
    /// Name-keyed locals for unoptimized code; module bodies share the globals here.
    locals_map: Option<Namespace>,
    slots: Vec<Value>,
    stack_base: usize,
    stack_top: usize,
    /// Offset of the last instruction started, `-1` before the first one.
    pub(crate) last_instr: i32,
    block: Option<Box<Block>>,
    block_depth: usize,
    /// Exception being handled by the innermost running `except` body.
    handled: Option<Exception>,
    cells_ready: bool,
    /// Set while suspended inside `YieldFrom`; the delegate sits at TOS.
    delegating: bool,
    /// Dictionary view of the locals, refreshed on demand for debuggers and `locals()`.
    locals_view: DictMap,
    pub(crate) last_line: Option<u32>,
}

impl Frame {
    /// Creates a frame over already-bound argument values.
    ///
    /// `locals` fills the leading local slots (remaining slots start unbound) and `closure`
    /// supplies one cell per free variable of `code`.
    pub fn new(
        code: Rc<Code>,
        globals: Namespace,
        builtins: Namespace,
        mut locals: Vec<Value>,
        closure: &[CellRef],
    ) -> RunResult<Self> {
        if closure.len() != code.nfrees() {
            return Err(ExcType::type_error(format!(
                "{}() requires a code object with {} free vars, not {}",
                code.name(),
                code.nfrees(),
                closure.len()
            )));
        }
        let nlocals = code.nlocals();
        locals.resize(nlocals, Value::Undefined);
        let mut slots = locals;
        slots.reserve_exact(code.ncells() + code.nfrees() + code.stacksize());
        slots.extend((0..code.ncells()).map(|_| Value::Undefined));
        slots.extend(closure.iter().cloned().map(Value::Cell));
        let stack_base = slots.len();
        slots.resize(stack_base + code.stacksize(), Value::Undefined);

        let flags = code.flags();
        let locals_map = if flags.contains(crate::bytecode::CodeFlags::OPTIMIZED) {
            None
        } else if flags.contains(crate::bytecode::CodeFlags::NEWLOCALS) {
            Some(Namespace::new())
        } else {
            Some(globals.clone())
        };

        Ok(Self {
            code,
            globals,
            builtins,
            locals_map,
            slots,
            stack_base,
            stack_top: stack_base,
            last_instr: -1,
            block: None,
            block_depth: 0,
            handled: None,
            cells_ready: false,
            delegating: false,
            locals_view: DictMap::default(),
            last_line: None,
        })
    }

    #[must_use]
    pub fn code(&self) -> &Rc<Code> {
        &self.code
    }

    #[must_use]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    #[must_use]
    pub fn builtins(&self) -> &Namespace {
        &self.builtins
    }

    pub(crate) fn locals_map(&self) -> Option<&Namespace> {
        self.locals_map.as_ref()
    }

    /// Offset of the last instruction started, `-1` if the frame has not run yet.
    #[must_use]
    pub fn last_instr(&self) -> i32 {
        self.last_instr
    }

    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.last_instr < 0
    }

    /// Offset execution continues from when the frame is resumed.
    pub(crate) fn resume_ip(&self) -> usize {
        usize::try_from(self.last_instr).map_or(0, |offset| offset + 2)
    }

    /// Source line of the instruction currently (or last) executing.
    #[must_use]
    pub fn current_line(&self) -> u32 {
        match usize::try_from(self.last_instr) {
            Ok(offset) => self.code.line_for(offset),
            Err(_) => self.code.first_line(),
        }
    }

    /// Approximate bytes held by the frame and its slot arena.
    #[must_use]
    pub fn arena_size(&self) -> usize {
        mem::size_of::<Self>() + self.slots.capacity() * mem::size_of::<Value>()
    }

    // === cells ===

    /// Creates this frame's cells, moving argument values into the cells that capture them.
    ///
    /// Runs once, before the first instruction.
    pub fn init_cells(&mut self) {
        if mem::replace(&mut self.cells_ready, true) {
            return;
        }
        let nlocals = self.code.nlocals();
        for index in 0..self.code.ncells() {
            let initial = self.code.cell2arg()[index].and_then(|arg| {
                let value = mem::replace(&mut self.slots[arg as usize], Value::Undefined);
                (!value.is_undefined()).then_some(value)
            });
            let family = self.code.cell_family(index).clone();
            self.slots[nlocals + index] = Value::Cell(CellRef::new(family, initial));
        }
    }

    /// The cell in cell/free slot `index`.
    pub(crate) fn deref(&self, index: usize) -> &CellRef {
        match &self.slots[self.code.nlocals() + index] {
            Value::Cell(cell) => cell,
            other => panic!("deref slot {index} holds {other:?} instead of a cell"),
        }
    }

    pub(crate) fn deref_count(&self) -> usize {
        self.code.ncells() + self.code.nfrees()
    }

    // === fast locals ===

    pub(crate) fn local(&self, index: usize) -> &Value {
        &self.slots[index]
    }

    pub(crate) fn set_local_slot(&mut self, index: usize, value: Value) {
        let old = mem::replace(&mut self.slots[index], value);
        drop(old);
    }

    // === operand stack ===

    #[inline]
    pub fn push(&mut self, value: Value) {
        debug_assert!(
            self.stack_top < self.slots.len(),
            "operand stack overflow in {} (stacksize {})",
            self.code.name(),
            self.code.stacksize()
        );
        self.slots[self.stack_top] = value;
        self.stack_top += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        assert!(self.stack_top > self.stack_base, "operand stack underflow in {}", self.code.name());
        self.stack_top -= 1;
        mem::replace(&mut self.slots[self.stack_top], Value::Undefined)
    }

    /// Pops `n` values, returned in push order.
    pub(crate) fn pop_n(&mut self, n: usize) -> Vec<Value> {
        assert!(self.stack_depth() >= n, "operand stack underflow in {}", self.code.name());
        let start = self.stack_top - n;
        let values = self.slots[start..self.stack_top]
            .iter_mut()
            .map(|slot| mem::replace(slot, Value::Undefined))
            .collect();
        self.stack_top = start;
        values
    }

    /// Value `depth` entries below TOS (`0` is TOS).
    #[inline]
    pub(crate) fn peek_at(&self, depth: usize) -> &Value {
        assert!(self.stack_depth() > depth, "operand stack underflow in {}", self.code.name());
        &self.slots[self.stack_top - 1 - depth]
    }

    #[inline]
    pub(crate) fn peek(&self) -> &Value {
        self.peek_at(0)
    }

    /// Number of values on the operand stack.
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.stack_top - self.stack_base
    }

    /// Pops values until the stack is `level` deep.
    pub(crate) fn truncate_stack(&mut self, level: usize) {
        debug_assert!(level <= self.stack_depth(), "block level above the stack top");
        while self.stack_depth() > level {
            drop(self.pop());
        }
    }

    // === blocks ===

    /// Pushes a block that restores the stack to `level` and jumps to `handler` on unwind.
    pub fn new_block(&mut self, kind: BlockKind, handler: usize, level: usize) {
        self.push_block(Block {
            kind,
            handler,
            level,
            matcher: None,
            saved: None,
            previous: None,
        });
    }

    pub(crate) fn new_except_block(&mut self, handler: usize, level: usize, matcher: Option<Value>) {
        self.push_block(Block {
            kind: BlockKind::Except,
            handler,
            level,
            matcher,
            saved: None,
            previous: None,
        });
    }

    pub(crate) fn new_except_body(&mut self, level: usize, saved: Option<Exception>) {
        self.push_block(Block {
            kind: BlockKind::ExceptBody,
            handler: 0,
            level,
            matcher: None,
            saved,
            previous: None,
        });
    }

    fn push_block(&mut self, mut block: Block) {
        block.previous = self.block.take();
        self.block = Some(Box::new(block));
        self.block_depth += 1;
    }

    /// Pops the innermost block. Panics if there is none, which means corrupt bytecode.
    pub fn pop_block(&mut self) -> Block {
        let Some(mut block) = self.block.take() else {
            panic!("block stack underflow in {}", self.code.name());
        };
        self.block = block.previous.take();
        self.block_depth -= 1;
        *block
    }

    #[must_use]
    pub fn block_top(&self) -> Option<&Block> {
        self.block.as_deref()
    }

    #[must_use]
    pub fn block_depth(&self) -> usize {
        self.block_depth
    }

    /// Whether closing a suspended frame could run code: any block is still open.
    #[must_use]
    pub fn has_open_blocks(&self) -> bool {
        self.block.is_some()
    }

    // === handled exception ===

    #[must_use]
    pub fn handled_exception(&self) -> Option<&Exception> {
        self.handled.as_ref()
    }

    pub(crate) fn replace_handled(&mut self, exc: Option<Exception>) -> Option<Exception> {
        mem::replace(&mut self.handled, exc)
    }

    // === delegation ===

    pub(crate) fn set_delegating(&mut self, delegating: bool) {
        self.delegating = delegating;
    }

    /// The iterator a suspended `YieldFrom` is delegating to.
    pub(crate) fn delegate(&self) -> Option<Value> {
        self.delegating.then(|| self.peek().clone())
    }

    /// Abandons the current delegation: drops the delegate and moves past the `YieldFrom`,
    /// so the next resumption continues with the instruction after it.
    pub(crate) fn finish_delegation(&mut self) {
        debug_assert!(self.delegating, "frame is not delegating");
        drop(self.pop());
        self.last_instr += 2;
        self.delegating = false;
    }

    // === locals view ===

    /// Refreshes and returns the dictionary view of this frame's variables.
    ///
    /// Covers fast locals and bound cell/free variables; unbound names are omitted.
    pub fn fast_to_locals(&mut self) -> &DictMap {
        let mut view = DictMap::default();
        if let Some(map) = &self.locals_map {
            view.extend(map.snapshot());
        }
        for (index, name) in self.code.varnames().iter().enumerate() {
            let value = &self.slots[index];
            if !value.is_undefined() {
                view.insert(name.clone(), value.clone());
            }
        }
        if self.cells_ready || self.code.ncells() == 0 {
            for index in 0..self.deref_count() {
                if let Value::Cell(cell) = &self.slots[self.code.nlocals() + index]
                    && let Some(value) = cell.get()
                {
                    view.insert(self.code.deref_name(index).clone(), value);
                }
            }
        }
        self.locals_view = view;
        &self.locals_view
    }

    /// The dictionary view as last refreshed, for editing before [`Self::locals_to_fast`].
    pub fn locals_view_mut(&mut self) -> &mut DictMap {
        &mut self.locals_view
    }

    /// Writes the dictionary view back into slots and cells.
    ///
    /// Names missing from the view are left untouched; cells are only stored to when the
    /// value actually changed, so syncing does not count as a rebinding.
    pub fn locals_to_fast(&mut self) {
        let view = mem::take(&mut self.locals_view);
        for (name, value) in &view {
            self.write_local(name, value.clone());
        }
        self.locals_view = view;
    }

    /// Snapshot of the frame's variables by name.
    pub fn locals(&mut self) -> DictMap {
        self.fast_to_locals().clone()
    }

    /// Rebinds variable `name`, returning false if this frame has no such variable.
    pub fn set_local(&mut self, name: &str, value: Value) -> bool {
        self.write_local(name, value)
    }

    fn write_local(&mut self, name: &str, value: Value) -> bool {
        if let Some(index) = self.code.varnames().iter().position(|var| &**var == name) {
            self.set_local_slot(index, value);
            return true;
        }
        if let Some(index) = (0..self.deref_count()).find(|&i| &**self.code.deref_name(i) == name) {
            if let Value::Cell(cell) = &self.slots[self.code.nlocals() + index] {
                if !cell.get().is_some_and(|current| current.is(&value)) {
                    cell.set(value);
                }
                return true;
            }
            return false;
        }
        if let Some(map) = &self.locals_map {
            map.set(name, value);
            return true;
        }
        false
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.qualname())
            .field("last_instr", &self.last_instr)
            .field("stack_depth", &self.stack_depth())
            .field("block_depth", &self.block_depth)
            .finish_non_exhaustive()
    }
}
