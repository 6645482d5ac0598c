//! Generator, coroutine and async-generator objects.
//!
//! All three wrap a suspended [`Frame`]. The frame is moved out while the body runs and
//! moved back when it suspends, so a generator that is already running has no frame to
//! resume and re-entrant calls are rejected.

use std::{
    cell::{Ref, RefCell},
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use strum::Display;

use crate::{
    bytecode::{Code, CodeFlags, Frame},
    value::Value,
};

/// Which flavour of suspendable object a code object produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Generator,
    Coroutine,
    AsyncGenerator,
}

impl GeneratorKind {
    #[must_use]
    pub fn from_flags(flags: CodeFlags) -> Option<Self> {
        if flags.contains(CodeFlags::ASYNC_GENERATOR) {
            Some(Self::AsyncGenerator)
        } else if flags.contains(CodeFlags::COROUTINE) {
            Some(Self::Coroutine)
        } else if flags.contains(CodeFlags::GENERATOR) {
            Some(Self::Generator)
        } else {
            None
        }
    }

    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async_generator",
        }
    }

    /// Name used in error messages, e.g. "async generator already executing".
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::Coroutine => "coroutine",
            Self::AsyncGenerator => "async generator",
        }
    }
}

/// Lifecycle of a generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created, body not started.
    Fresh,
    /// Paused at a `yield` or inside a `yield from`/`await`.
    Suspended,
    /// Body is executing; the frame is checked out.
    Running,
    /// Returned, raised, or closed.
    Finished,
}

/// Methods of a generator object exposed to running code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum GeneratorMethod {
    Send,
    Throw,
    Close,
}

pub(crate) struct Generator {
    kind: GeneratorKind,
    code: Rc<Code>,
    state: GeneratorState,
    frame: Option<Box<Frame>>,
    finalizers: Weak<FinalizerQueue>,
    /// Already handed to the finalizer queue once.
    finalized: bool,
}

impl Drop for Generator {
    fn drop(&mut self) {
        if self.state != GeneratorState::Suspended || self.finalized {
            return;
        }
        let Some(frame) = self.frame.take() else {
            return;
        };
        if frame.has_open_blocks()
            && let Some(queue) = self.finalizers.upgrade()
        {
            queue.push(PendingFinalizer { kind: self.kind, frame });
        }
    }
}

/// Shared handle to a generator object.
#[derive(Clone)]
pub struct GeneratorRef(Rc<RefCell<Generator>>);

impl GeneratorRef {
    pub(crate) fn new(frame: Frame, kind: GeneratorKind, finalizers: Weak<FinalizerQueue>) -> Self {
        Self(Rc::new(RefCell::new(Generator {
            kind,
            code: frame.code().clone(),
            state: GeneratorState::Fresh,
            frame: Some(Box::new(frame)),
            finalizers,
            finalized: false,
        })))
    }

    /// Rebuilds a suspended generator around a frame taken from the finalizer queue.
    pub(crate) fn resurrect(pending: PendingFinalizer) -> Self {
        Self(Rc::new(RefCell::new(Generator {
            kind: pending.kind,
            code: pending.frame.code().clone(),
            state: GeneratorState::Suspended,
            frame: Some(pending.frame),
            finalizers: Weak::new(),
            finalized: true,
        })))
    }

    fn inner(&self) -> Ref<'_, Generator> {
        self.0.borrow()
    }

    #[must_use]
    pub fn kind(&self) -> GeneratorKind {
        self.inner().kind
    }

    #[must_use]
    pub fn state(&self) -> GeneratorState {
        self.inner().state
    }

    #[must_use]
    pub fn code(&self) -> Rc<Code> {
        self.inner().code.clone()
    }

    #[must_use]
    pub fn name(&self) -> Rc<str> {
        self.inner().code.name().clone()
    }

    #[must_use]
    pub fn qualname(&self) -> Rc<str> {
        self.inner().code.qualname().clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Line the generator is paused at (`gi_frame.f_lineno`); `None` unless it has a frame.
    #[must_use]
    pub fn current_line(&self) -> Option<u32> {
        self.inner().frame.as_ref().map(|frame| frame.current_line())
    }

    /// The iterator this generator is delegating to, if suspended inside `yield from`.
    #[must_use]
    pub fn delegate(&self) -> Option<Value> {
        let inner = self.inner();
        if inner.state != GeneratorState::Suspended {
            return None;
        }
        inner.frame.as_ref().and_then(|frame| frame.delegate())
    }

    /// Snapshot of the suspended frame's variables.
    #[must_use]
    pub fn frame_locals(&self) -> Option<crate::value::DictMap> {
        self.0.borrow_mut().frame.as_mut().map(|frame| frame.locals())
    }

    pub(crate) fn set_state(&self, state: GeneratorState) {
        self.0.borrow_mut().state = state;
    }

    /// Checks the frame out for execution and marks the generator running.
    pub(crate) fn take_frame(&self) -> Box<Frame> {
        let mut inner = self.0.borrow_mut();
        inner.state = GeneratorState::Running;
        match inner.frame.take() {
            Some(frame) => frame,
            None => panic!("generator {} has no frame to resume", inner.code.qualname()),
        }
    }

    /// Puts a suspended frame back.
    pub(crate) fn suspend(&self, frame: Box<Frame>) {
        let mut inner = self.0.borrow_mut();
        inner.state = GeneratorState::Suspended;
        inner.frame = Some(frame);
    }

    /// Marks the generator finished, returning its frame (if any) so the caller can drop it
    /// outside the borrow.
    pub(crate) fn finish(&self) -> Option<Box<Frame>> {
        let mut inner = self.0.borrow_mut();
        inner.state = GeneratorState::Finished;
        inner.frame.take()
    }

    /// Drops the delegate of a suspended `yield from` and moves past it.
    pub(crate) fn finish_delegation(&self) {
        if let Some(frame) = self.0.borrow_mut().frame.as_mut() {
            frame.finish_delegation();
        }
    }
}

impl fmt::Debug for GeneratorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        write!(
            f,
            "<{} object {} ({:?})>",
            inner.kind.type_name(),
            inner.code.qualname(),
            inner.state
        )
    }
}

/// A frame whose generator was dropped while suspended inside a block.
pub(crate) struct PendingFinalizer {
    kind: GeneratorKind,
    frame: Box<Frame>,
}

/// Frames awaiting finalization, owned by the VM and reached by generators through a weak
/// reference.
#[derive(Default)]
pub(crate) struct FinalizerQueue(RefCell<VecDeque<PendingFinalizer>>);

impl FinalizerQueue {
    fn push(&self, pending: PendingFinalizer) {
        self.0.borrow_mut().push_back(pending);
    }

    pub(crate) fn pop(&self) -> Option<PendingFinalizer> {
        self.0.borrow_mut().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl fmt::Debug for FinalizerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FinalizerQueue({} pending)", self.0.borrow().len())
    }
}
