#![doc = include_str!("../../../README.md")]

mod builtins;
mod bytecode;
mod controller;
mod exception;
mod heap;
mod intern;
mod io;
mod parse;
mod run;
mod value;

pub use bytecode::{DecodeError, Program};
pub use controller::{NotAwaitingInput, SessionController, SessionResult, SessionStatus};
pub use exception::{ExcType, Exception};
pub use io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint};
pub use parse::{CodeLoc, CodeRange, Diagnostic, analyze};
pub use run::{DEFAULT_MAX_FRAME_DEPTH, RunProgress, Runner, Snapshot};
