use std::{
    borrow::Cow,
    cell::RefCell,
    io::{self, Write as _},
};

/// Trait for handling output from the `print()` builtin function.
///
/// Implement this trait to capture or redirect print output from interpreted
/// code. The default implementation `StdPrint` writes to stdout.
pub trait PrintWriter {
    /// Called once for each formatted argument passed to `print()`, and for
    /// `input()` prompts.
    ///
    /// This method is responsible for writing only the given argument's text, and must
    /// not add separators or a trailing newline. Separators (such as spaces) and the
    /// final terminator (such as a newline) are emitted via [`PrintWriter::stdout_push`].
    fn stdout_write(&mut self, output: Cow<'_, str>);

    /// Add a single character to stdout.
    ///
    /// Generally called to add spaces and newlines within print output.
    fn stdout_push(&mut self, end: char);
}

/// Default `PrintWriter` that writes to stdout.
#[derive(Debug)]
pub struct StdPrint;

thread_local! {
    /// Thread-local stdout buffer for `StdPrint`.
    ///
    /// Buffering keeps partial lines (such as `input()` prompts) intact until
    /// the writer is dropped or flushed.
    static STDOUT_BUFFER: RefCell<String> = const { RefCell::new(String::new()) };
}

impl StdPrint {
    /// Writes any buffered output to stdout immediately.
    ///
    /// Used before blocking on stdin so that a pending `input()` prompt is
    /// visible to the user.
    pub fn flush() {
        STDOUT_BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();
            if buffer.is_empty() {
                return;
            }
            let _ = io::stdout().write_all(buffer.as_bytes());
            let _ = io::stdout().flush();
            buffer.clear();
        });
    }
}

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        STDOUT_BUFFER.with(|buffer| buffer.borrow_mut().push_str(&output));
    }

    fn stdout_push(&mut self, end: char) {
        STDOUT_BUFFER.with(|buffer| buffer.borrow_mut().push(end));
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        Self::flush();
    }
}

/// A `PrintWriter` that collects all output into a string.
///
/// Useful for testing or capturing print output programmatically.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    /// Creates a new empty `CollectStringPrint`.
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// Returns the collected output as a string slice.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: Cow<'_, str>) {
        self.0.push_str(&output);
    }

    fn stdout_push(&mut self, end: char) {
        self.0.push(end);
    }
}

/// `PrintWriter` that ignores all output.
///
/// Useful for suppressing print output during testing or benchmarking.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: Cow<'_, str>) {}

    fn stdout_push(&mut self, _end: char) {}
}
