use std::io::{self, Write as _};

use crate::exception::{ExcType, Exception, RunResult};

/// Destination of the `print()` builtin.
///
/// `print(a, b)` arrives as four writes: `a`'s text, the separator, `b`'s text and the
/// terminator, followed by one [`PrintWriter::flush`].
pub trait PrintWriter {
    fn write(&mut self, text: &str) -> RunResult<()>;

    /// Called once per `print()` call, after its terminator.
    fn flush(&mut self) -> RunResult<()> {
        Ok(())
    }
}

/// Writes to the process stdout, flushing after every `print()`.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn write(&mut self, text: &str) -> RunResult<()> {
        io::stdout().lock().write_all(text.as_bytes()).map_err(stdout_error)
    }

    fn flush(&mut self) -> RunResult<()> {
        io::stdout().lock().flush().map_err(stdout_error)
    }
}

fn stdout_error(err: io::Error) -> Exception {
    Exception::new(ExcType::RuntimeError, format!("failed to write to stdout: {err}"))
}

/// Accumulates everything printed, for tests and embedders that inspect output.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write(&mut self, text: &str) -> RunResult<()> {
        self.0.push_str(text);
        Ok(())
    }
}

/// Discards output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write(&mut self, _text: &str) -> RunResult<()> {
        Ok(())
    }
}
