//! Bytecode representation, compilation, and execution.

mod builder;
mod code;
mod compiler;
mod op;
mod vm;

pub use code::{DecodeError, Program};
pub(crate) use code::{decode_payload, encode_payload};
pub(crate) use compiler::compile;
pub(crate) use vm::{VM, VMExit, VMSnapshot};
