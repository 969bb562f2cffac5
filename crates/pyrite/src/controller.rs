//! Host-driven session management.
//!
//! A [`SessionController`] runs at most one script session at a time and
//! drives it through the suspend/resume protocol: `start` runs until the
//! script finishes, errors, or stops at `input()`; `provide_input` continues
//! a waiting script; `cancel` discards it. Output and timing are reported per
//! call, and timing only counts VM execution, never the host's think time
//! between calls. When a session errors, the formatted message is appended to
//! that call's output so hosts that only display the output stream still show
//! the failure.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::{
    bytecode::Program,
    exception::Exception,
    io::CollectStringPrint,
    run::{DEFAULT_MAX_FRAME_DEPTH, RunProgress, Runner, Snapshot},
};

/// The host called `provide_input` while no script was waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotAwaitingInput;

impl fmt::Display for NotAwaitingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no script is awaiting input")
    }
}

impl std::error::Error for NotAwaitingInput {}

/// How a session call left the script.
#[derive(Debug)]
pub enum SessionStatus {
    /// The script ran to completion.
    Finished,
    /// The script is suspended at `input()`; call
    /// [`SessionController::provide_input`] next.
    AwaitingInput,
    /// Compilation or execution failed; the session is over.
    Errored(Exception),
}

/// Result of one controller call.
#[derive(Debug)]
pub struct SessionResult {
    pub status: SessionStatus,
    /// Output produced during this call only. Errored calls end with the
    /// formatted error message.
    pub output: String,
    /// Total VM execution time for the session in milliseconds, summed over
    /// all segments so far. `None` until the session ends (and for scripts
    /// that never compiled).
    pub execution_time_ms: Option<f64>,
}

struct ActiveSession {
    snapshot: Snapshot,
    /// VM time accumulated over earlier segments.
    elapsed: Duration,
}

/// Runs scripts one session at a time on behalf of a host.
pub struct SessionController {
    max_frame_depth: usize,
    session: Option<ActiveSession>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_depth: DEFAULT_MAX_FRAME_DEPTH,
            session: None,
        }
    }

    #[must_use]
    pub fn with_max_frame_depth(max_frame_depth: usize) -> Self {
        Self {
            max_frame_depth,
            session: None,
        }
    }

    /// Whether a script is currently suspended at `input()`.
    #[must_use]
    pub fn is_awaiting_input(&self) -> bool {
        self.session.is_some()
    }

    /// Compiles and runs a script, discarding any previous session.
    pub fn start(&mut self, source: &str) -> SessionResult {
        self.session = None;
        let runner = match Runner::new(source) {
            Ok(runner) => runner,
            Err(e) => {
                return SessionResult {
                    output: format!("{e}\n"),
                    status: SessionStatus::Errored(e),
                    execution_time_ms: None,
                };
            }
        };
        self.run_segment(runner.with_max_frame_depth(self.max_frame_depth), Duration::ZERO)
    }

    /// Runs an already-compiled program, discarding any previous session.
    pub fn start_program(&mut self, program: Program) -> SessionResult {
        self.session = None;
        let runner = Runner::from_program(program).with_max_frame_depth(self.max_frame_depth);
        self.run_segment(runner, Duration::ZERO)
    }

    /// Continues the waiting script with one line of input.
    ///
    /// Fails without touching the session when no script is waiting.
    pub fn provide_input(&mut self, input: &str) -> Result<SessionResult, NotAwaitingInput> {
        let Some(active) = self.session.take() else {
            return Err(NotAwaitingInput);
        };
        let mut print = CollectStringPrint::new();
        let started = Instant::now();
        let result = active.snapshot.run(input, &mut print);
        let segment = started.elapsed();
        Ok(self.finish_segment(result, print.into_output(), active.elapsed + segment))
    }

    /// Discards the current session, if any.
    pub fn cancel(&mut self) {
        self.session = None;
    }

    fn run_segment(&mut self, runner: Runner, prior: Duration) -> SessionResult {
        let mut print = CollectStringPrint::new();
        let started = Instant::now();
        let result = runner.start(&mut print);
        let segment = started.elapsed();
        self.finish_segment(result, print.into_output(), prior + segment)
    }

    fn finish_segment(
        &mut self,
        result: Result<RunProgress, Exception>,
        output: String,
        elapsed: Duration,
    ) -> SessionResult {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        match result {
            Ok(RunProgress::Complete) => SessionResult {
                status: SessionStatus::Finished,
                output,
                execution_time_ms: Some(elapsed_ms),
            },
            Ok(RunProgress::InputRequest(snapshot)) => {
                self.session = Some(ActiveSession { snapshot, elapsed });
                SessionResult {
                    status: SessionStatus::AwaitingInput,
                    output,
                    execution_time_ms: None,
                }
            }
            Err(e) => {
                let mut output = output;
                output.push_str(&e.to_string());
                output.push('\n');
                SessionResult {
                    status: SessionStatus::Errored(e),
                    output,
                    execution_time_ms: Some(elapsed_ms),
                }
            }
        }
    }
}
