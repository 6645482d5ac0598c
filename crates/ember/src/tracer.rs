//! VM execution tracing infrastructure.
//!
//! The VM is parameterized over a [`VmTracer`]; with [`NoopTracer`] every hook is an empty
//! inlined default and the whole layer compiles away, the same way
//! [`NoLimitTracker`](crate::resource::NoLimitTracker) removes resource accounting.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters, call and stack depth |
//! | [`CoverageTracer`] | Which bytecode offsets and lines executed |
//! | [`RecordingTracer`] | Full event recording for post-mortem inspection |
//!
//! How often the per-step hooks fire is chosen by [`VmTracer::granularity`]:
//! [`TraceGranularity::Lines`] delivers [`VmTracer::on_line`] only, while
//! [`TraceGranularity::Instructions`] delivers both `on_line` and
//! [`VmTracer::on_instruction`].

use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::{
    bytecode::{BlockKind, Frame, Opcode},
    exception::{ExcType, Exception},
};

/// How finely the dispatch loop reports progress to the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceGranularity {
    /// Only the event hooks (calls, returns, exceptions, ...) fire.
    Off,
    /// `on_line` fires whenever execution reaches a new source line.
    Lines,
    /// `on_instruction` fires before every instruction, in addition to `on_line`.
    Instructions,
}

/// Trace event recorded by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Instruction {
        /// Byte offset of the opcode.
        ip: usize,
        opcode: Opcode,
        /// Operand-stack depth before the instruction runs.
        stack_depth: usize,
    },
    Line {
        function: String,
        line: u32,
    },
    Call {
        func_name: String,
        /// Call depth after entering the frame.
        depth: usize,
    },
    Return {
        depth: usize,
    },
    Exception {
        exc_type: ExcType,
        message: String,
        depth: usize,
    },
    Yield {
        depth: usize,
    },
    Resume {
        depth: usize,
    },
    CellLoad {
        slot: usize,
        cells_len: usize,
    },
    CellStore {
        slot: usize,
        cells_len: usize,
    },
    MakeFunction {
        cell_count: usize,
        defaults_count: usize,
    },
    BlockPush {
        kind: BlockKind,
        /// Block-stack depth after the push.
        depth: usize,
    },
    BlockPop {
        kind: BlockKind,
        depth: usize,
    },
    Unraisable {
        exc_type: ExcType,
        message: String,
    },
}

/// Hooks called by the VM at execution events.
///
/// Every hook has a no-op default, so implementations only override what they observe.
pub trait VmTracer: fmt::Debug {
    /// Which per-step hooks the dispatch loop should deliver.
    #[inline(always)]
    fn granularity(&self) -> TraceGranularity {
        TraceGranularity::Instructions
    }

    /// Called before each instruction when the granularity is `Instructions`.
    ///
    /// This is the hottest hook; keep it cheap.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called when execution reaches a new source line, or jumps backwards onto a line.
    ///
    /// The frame is passed mutably so a debugger can inspect and rewrite locals through
    /// [`Frame::fast_to_locals`] and [`Frame::locals_to_fast`].
    #[inline(always)]
    fn on_line(&mut self, _frame: &mut Frame, _line: u32) {}

    /// Called when a frame starts or resumes running a function body.
    #[inline(always)]
    fn on_call(&mut self, _func_name: &str, _depth: usize) {}

    /// Called when a frame returns or finishes with an exception.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when an exception is raised inside a frame, before handlers are searched.
    #[inline(always)]
    fn on_exception(&mut self, _exc: &Exception, _depth: usize) {}

    #[inline(always)]
    fn on_yield(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_resume(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_cell_load(&mut self, _slot: usize, _cells_len: usize) {}

    #[inline(always)]
    fn on_cell_store(&mut self, _slot: usize, _cells_len: usize) {}

    #[inline(always)]
    fn on_make_function(&mut self, _cell_count: usize, _defaults_count: usize) {}

    #[inline(always)]
    fn on_block_push(&mut self, _kind: BlockKind, _depth: usize) {}

    #[inline(always)]
    fn on_block_pop(&mut self, _kind: BlockKind, _depth: usize) {}

    /// Called with an exception that had nowhere to go, e.g. one raised by a generator
    /// being finalized after its owner dropped it.
    #[inline(always)]
    fn on_unraisable(&mut self, _exc: &Exception) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {
    #[inline(always)]
    fn granularity(&self) -> TraceGranularity {
        TraceGranularity::Off
    }
}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints a human-readable execution log to stderr.
///
/// ```text
///   >>> CALL outer                depth=1
/// [    0] LoadConst  stack=0  frames=1
///   ... line 3 in outer
///   !!! ZeroDivisionError: division by zero
///   <<< RETURN              depth=0
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Stop logging instructions after this many; `None` logs everything.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracer that goes quiet after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {opcode}  stack={stack_depth}  frames={frame_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_line(&mut self, frame: &mut Frame, line: u32) {
        if !self.stopped {
            eprintln!("  ... line {line} in {}", frame.code().qualname());
        }
    }

    fn on_call(&mut self, func_name: &str, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {func_name:<20} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN              depth={depth}");
        }
    }

    fn on_exception(&mut self, exc: &Exception, _depth: usize) {
        if !self.stopped {
            eprintln!("  !!! {exc}");
        }
    }

    fn on_yield(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  ~~~ YIELD               depth={depth}");
        }
    }

    fn on_make_function(&mut self, cell_count: usize, defaults_count: usize) {
        if self.stopped {
            return;
        }
        if cell_count > 0 {
            eprintln!("  +++ MAKE CLOSURE  cells={cell_count} defaults={defaults_count}");
        } else {
            eprintln!("  +++ MAKE FUNCTION defaults={defaults_count}");
        }
    }

    fn on_unraisable(&mut self, exc: &Exception) {
        eprintln!("Exception ignored in generator finalizer:\n{}", exc.summary());
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Tracer that collects execution statistics.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: AHashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    max_stack_depth: usize,
    total_calls: u64,
    total_cell_loads: u64,
    total_cell_stores: u64,
    total_exceptions: u64,
}

/// Summary produced by [`ProfilingTracer::report`].
#[derive(Debug)]
pub struct ProfilingReport {
    /// Per-opcode execution counts, most frequent first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    /// Deepest call nesting observed.
    pub max_depth: usize,
    /// Deepest operand stack observed in any frame, before an instruction ran.
    pub max_stack_depth: usize,
    pub total_calls: u64,
    pub total_cell_loads: u64,
    pub total_cell_stores: u64,
    pub total_exceptions: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            max_stack_depth: self.max_stack_depth,
            total_calls: self.total_calls,
            total_cell_loads: self.total_cell_loads,
            total_cell_stores: self.total_cell_stores,
            total_exceptions: self.total_exceptions,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
        self.max_stack_depth = self.max_stack_depth.max(stack_depth);
    }

    fn on_call(&mut self, _func_name: &str, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_exception(&mut self, _exc: &Exception, _depth: usize) {
        self.total_exceptions += 1;
    }

    fn on_cell_load(&mut self, _slot: usize, _cells_len: usize) {
        self.total_cell_loads += 1;
    }

    fn on_cell_store(&mut self, _slot: usize, _cells_len: usize) {
        self.total_cell_stores += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Max stack depth:    {}", self.max_stack_depth)?;
        writeln!(f, "Cell loads:         {}", self.total_cell_loads)?;
        writeln!(f, "Cell stores:        {}", self.total_cell_stores)?;
        writeln!(f, "Exceptions raised:  {}", self.total_exceptions)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions.max(1) as f64) * 100.0;
            writeln!(f, "  {opcode:<20} {count:>10}  ({pct:>5.1}%)")?;
        }
        Ok(())
    }
}

// ============================================================================
// CoverageTracer
// ============================================================================

/// Tracer that records which bytecode offsets and source lines executed.
#[derive(Debug, Default)]
pub struct CoverageTracer {
    ips: AHashSet<usize>,
    lines: AHashSet<u32>,
}

impl CoverageTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn covered_ips(&self) -> &AHashSet<usize> {
        &self.ips
    }

    #[must_use]
    pub fn covered_lines(&self) -> &AHashSet<u32> {
        &self.lines
    }

    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.ips.len()
    }
}

impl VmTracer for CoverageTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        self.ips.insert(ip);
    }

    fn on_line(&mut self, _frame: &mut Frame, line: u32) {
        self.lines.insert(line);
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Tracer that records every event in order.
///
/// Allocates per event, so it is meant for tests and short debugging runs.
#[derive(Debug)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
    granularity: TraceGranularity,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            limit: None,
            granularity: TraceGranularity::Instructions,
        }
    }

    /// Stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
            granularity: TraceGranularity::Instructions,
        }
    }

    /// Records at a coarser granularity, e.g. lines only.
    #[must_use]
    pub fn with_granularity(mut self, granularity: TraceGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Source lines reported through `on_line`, in order.
    #[must_use]
    pub fn lines(&self) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Line { line, .. } => Some(*line),
                _ => None,
            })
            .collect()
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|limit| self.events.len() < limit) {
            self.events.push(event);
        }
    }
}

impl Default for RecordingTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl VmTracer for RecordingTracer {
    fn granularity(&self) -> TraceGranularity {
        self.granularity
    }

    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        self.record(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_line(&mut self, frame: &mut Frame, line: u32) {
        self.record(TraceEvent::Line {
            function: frame.code().qualname().to_string(),
            line,
        });
    }

    fn on_call(&mut self, func_name: &str, depth: usize) {
        self.record(TraceEvent::Call {
            func_name: func_name.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_exception(&mut self, exc: &Exception, depth: usize) {
        self.record(TraceEvent::Exception {
            exc_type: exc.exc_type(),
            message: exc.message(),
            depth,
        });
    }

    fn on_yield(&mut self, depth: usize) {
        self.record(TraceEvent::Yield { depth });
    }

    fn on_resume(&mut self, depth: usize) {
        self.record(TraceEvent::Resume { depth });
    }

    fn on_cell_load(&mut self, slot: usize, cells_len: usize) {
        self.record(TraceEvent::CellLoad { slot, cells_len });
    }

    fn on_cell_store(&mut self, slot: usize, cells_len: usize) {
        self.record(TraceEvent::CellStore { slot, cells_len });
    }

    fn on_make_function(&mut self, cell_count: usize, defaults_count: usize) {
        self.record(TraceEvent::MakeFunction {
            cell_count,
            defaults_count,
        });
    }

    fn on_block_push(&mut self, kind: BlockKind, depth: usize) {
        self.record(TraceEvent::BlockPush { kind, depth });
    }

    fn on_block_pop(&mut self, kind: BlockKind, depth: usize) {
        self.record(TraceEvent::BlockPop { kind, depth });
    }

    fn on_unraisable(&mut self, exc: &Exception) {
        self.record(TraceEvent::Unraisable {
            exc_type: exc.exc_type(),
            message: exc.message(),
        });
    }
}
