//! Budgets for running untrusted bytecode.
//!
//! The VM reports every instruction, frame entry and allocation to its [`ResourceTracker`].
//! A refusal becomes an ordinary exception raised at that point, so `finally` blocks still
//! run while the budget unwinds the stack.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::exception::{ExcType, Exception};

/// Frames allowed on the host stack when no limit is configured.
///
/// Every frame runs on the host stack, so this sits well below what a default 2MB thread
/// stack can hold.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;

/// A budget that ran out.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    Instructions { limit: usize },
    Deadline { limit: Duration, elapsed: Duration },
    Allocations { limit: usize },
    Memory { limit: usize, requested: usize },
    Recursion { limit: usize },
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instructions { limit } => write!(f, "instruction limit of {limit} exceeded"),
            Self::Deadline { limit, elapsed } => {
                write!(f, "time limit of {limit:?} exceeded after {elapsed:?}")
            }
            Self::Allocations { limit } => write!(f, "allocation limit of {limit} exceeded"),
            Self::Memory { limit, requested } => {
                write!(f, "memory limit of {limit} bytes exceeded ({requested} bytes requested)")
            }
            Self::Recursion { .. } => f.write_str("maximum recursion depth exceeded"),
        }
    }
}

impl std::error::Error for ResourceError {}

impl ResourceError {
    /// Exception class raised into running code for this error.
    #[must_use]
    pub fn exc_type(&self) -> ExcType {
        match self {
            Self::Instructions { .. } | Self::Deadline { .. } => ExcType::TimeoutError,
            Self::Allocations { .. } | Self::Memory { .. } => ExcType::MemoryError,
            Self::Recursion { .. } => ExcType::RecursionError,
        }
    }
}

impl From<ResourceError> for Exception {
    fn from(err: ResourceError) -> Self {
        Self::new(err.exc_type(), err.to_string())
    }
}

/// What the VM is about to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A frame's slot arena, released again when the frame finishes.
    Frame,
    /// A tuple, list or dict built by running code. Never released.
    Container,
}

/// Receives the VM's resource events and decides whether execution may continue.
pub trait ResourceTracker: fmt::Debug {
    /// Called at every instruction boundary.
    fn on_instruction(&mut self) -> Result<(), ResourceError>;

    /// Called before a frame starts or resumes, with the number of frames already running.
    fn enter_frame(&self, depth: usize) -> Result<(), ResourceError>;

    /// Called before an allocation; `bytes` is only evaluated by trackers that count memory.
    fn reserve(&mut self, what: Allocation, bytes: impl FnOnce() -> usize) -> Result<(), ResourceError>;

    /// Called when a finished frame gives its arena back.
    fn release(&mut self, bytes: impl FnOnce() -> usize);
}

fn check_depth(limit: Option<usize>, depth: usize) -> Result<(), ResourceError> {
    let limit = limit.unwrap_or(DEFAULT_MAX_RECURSION_DEPTH);
    if depth >= limit {
        return Err(ResourceError::Recursion { limit });
    }
    Ok(())
}

/// Tracker that only enforces [`DEFAULT_MAX_RECURSION_DEPTH`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    #[inline]
    fn on_instruction(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn enter_frame(&self, depth: usize) -> Result<(), ResourceError> {
        check_depth(None, depth)
    }

    #[inline]
    fn reserve(&mut self, _what: Allocation, _bytes: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        Ok(())
    }

    #[inline]
    fn release(&mut self, _bytes: impl FnOnce() -> usize) {}
}

/// Limits for a [`LimitedTracker`]; anything left unset is unbounded.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub instructions: Option<usize>,
    pub allocations: Option<usize>,
    /// Wall-clock time measured from the tracker's creation.
    pub duration: Option<Duration>,
    /// Approximate bytes held by live frames plus every container built so far.
    pub memory: Option<usize>,
    /// Frame nesting limit, [`DEFAULT_MAX_RECURSION_DEPTH`] when unset.
    pub recursion_depth: Option<usize>,
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_operations(self, limit: usize) -> Self {
        Self {
            instructions: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn max_allocations(self, limit: usize) -> Self {
        Self {
            allocations: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn max_duration(self, limit: Duration) -> Self {
        Self {
            duration: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn max_memory(self, limit: usize) -> Self {
        Self {
            memory: Some(limit),
            ..self
        }
    }

    #[must_use]
    pub fn max_recursion_depth(self, limit: usize) -> Self {
        Self {
            recursion_depth: Some(limit),
            ..self
        }
    }
}

/// Tracker enforcing [`ResourceLimits`]. The clock starts when the tracker is created.
#[derive(Debug, Clone)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    started: Instant,
    instructions: usize,
    allocations: usize,
    memory: usize,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            started: Instant::now(),
            instructions: 0,
            allocations: 0,
            memory: 0,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Instructions started so far, counted only when an instruction limit is set.
    #[must_use]
    pub fn instructions_executed(&self) -> usize {
        self.instructions
    }

    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Bytes currently charged, counted only when a memory limit is set.
    #[must_use]
    pub fn memory_in_use(&self) -> usize {
        self.memory
    }
}

impl ResourceTracker for LimitedTracker {
    fn on_instruction(&mut self) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.instructions {
            self.instructions += 1;
            if self.instructions > limit {
                return Err(ResourceError::Instructions { limit });
            }
        }
        if let Some(limit) = self.limits.duration {
            let elapsed = self.started.elapsed();
            if elapsed > limit {
                return Err(ResourceError::Deadline { limit, elapsed });
            }
        }
        Ok(())
    }

    fn enter_frame(&self, depth: usize) -> Result<(), ResourceError> {
        check_depth(self.limits.recursion_depth, depth)
    }

    fn reserve(&mut self, _what: Allocation, bytes: impl FnOnce() -> usize) -> Result<(), ResourceError> {
        if let Some(limit) = self.limits.allocations
            && self.allocations >= limit
        {
            return Err(ResourceError::Allocations { limit });
        }
        if let Some(limit) = self.limits.memory {
            let requested = bytes();
            if self.memory + requested > limit {
                return Err(ResourceError::Memory { limit, requested });
            }
            self.memory += requested;
        }
        self.allocations += 1;
        Ok(())
    }

    fn release(&mut self, bytes: impl FnOnce() -> usize) {
        if self.limits.memory.is_some() {
            self.memory = self.memory.saturating_sub(bytes());
        }
    }
}

/// Cross-thread request for a running VM to stop.
///
/// The VM polls the flag at every instruction boundary; a pending request is consumed and
/// raised as `KeyboardInterrupt` into the running frame.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an interrupt. Safe to call from any thread.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_limit_trips_after_max() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_operations(2));
        assert!(tracker.on_instruction().is_ok());
        assert!(tracker.on_instruction().is_ok());
        assert_eq!(tracker.on_instruction(), Err(ResourceError::Instructions { limit: 2 }));
        assert_eq!(tracker.instructions_executed(), 3);
    }

    #[test]
    fn released_frames_are_credited_back() {
        let mut tracker = LimitedTracker::new(ResourceLimits::new().max_memory(100));
        tracker.reserve(Allocation::Frame, || 80).unwrap();
        assert_eq!(
            tracker.reserve(Allocation::Container, || 40),
            Err(ResourceError::Memory {
                limit: 100,
                requested: 40
            })
        );
        tracker.release(|| 80);
        tracker.reserve(Allocation::Container, || 40).unwrap();
        assert_eq!(tracker.memory_in_use(), 40);
        assert_eq!(tracker.allocations(), 2);
    }

    #[test]
    fn unlimited_tracker_still_bounds_recursion() {
        assert!(NoLimitTracker.enter_frame(DEFAULT_MAX_RECURSION_DEPTH - 1).is_ok());
        let err = NoLimitTracker.enter_frame(DEFAULT_MAX_RECURSION_DEPTH).unwrap_err();
        let exc = Exception::from(err);
        assert_eq!(exc.exc_type(), ExcType::RecursionError);
        assert_eq!(exc.to_string(), "RecursionError: maximum recursion depth exceeded");
    }

    #[test]
    fn interrupt_is_consumed_once() {
        let handle = InterruptHandle::new();
        handle.clone().interrupt();
        assert!(handle.is_pending());
        assert!(handle.take());
        assert!(!handle.take());
    }
}
