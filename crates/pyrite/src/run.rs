//! Compiling and running scripts, including suspend/resume at `input()`.
//!
//! A [`Runner`] compiles source and executes it until it finishes or stops at
//! an `input()` call. A stopped script becomes a [`Snapshot`]: a fully owned,
//! serializable execution state that can be persisted with [`Snapshot::dump`]
//! and continued later, in this process or another one.

use serde::{Deserialize, Serialize};

use crate::{
    bytecode::{DecodeError, Program, VM, VMExit, VMSnapshot, compile, decode_payload, encode_payload},
    exception::Exception,
    heap::Heap,
    io::PrintWriter,
    value::Value,
};

/// Frame-depth guard applied when no explicit limit is configured.
pub const DEFAULT_MAX_FRAME_DEPTH: usize = 1000;

const SNAPSHOT_MAGIC: &[u8; 4] = b"PYRS";

/// How far a script got when a run segment ended.
#[derive(Debug)]
pub enum RunProgress {
    /// The script ran to completion.
    Complete,
    /// The script is suspended at `input()`; resume through the snapshot.
    InputRequest(Snapshot),
}

/// A compiled script ready to start.
#[derive(Debug)]
pub struct Runner {
    program: Program,
    max_frame_depth: usize,
}

impl Runner {
    /// Compiles `source` into a runnable program.
    pub fn new(source: &str) -> Result<Self, Exception> {
        Ok(Self::from_program(compile(source)?))
    }

    /// Wraps an already-compiled program, e.g. one loaded with
    /// [`Program::from_bytes`].
    #[must_use]
    pub fn from_program(program: Program) -> Self {
        Self {
            program,
            max_frame_depth: DEFAULT_MAX_FRAME_DEPTH,
        }
    }

    #[must_use]
    pub fn with_max_frame_depth(mut self, max_frame_depth: usize) -> Self {
        self.max_frame_depth = max_frame_depth;
        self
    }

    /// Access to the compiled program, e.g. for [`Program::to_bytes`].
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Runs the script from the beginning.
    pub fn start(self, print: &mut dyn PrintWriter) -> Result<RunProgress, Exception> {
        let mut heap = Heap::new();
        let mut globals = vec![Value::Undefined; self.program.global_names.len()];
        let mut vm = VM::new(&self.program, &mut heap, &mut globals, print, self.max_frame_depth);
        match vm.run() {
            Ok(VMExit::Done) => Ok(RunProgress::Complete),
            Ok(VMExit::InputRequest) => {
                let vm = vm.into_snapshot();
                Ok(RunProgress::InputRequest(Snapshot {
                    program: self.program,
                    vm,
                    heap,
                    globals,
                    max_frame_depth: self.max_frame_depth,
                }))
            }
            Err(e) => Err(Exception::from(e)),
        }
    }
}

/// The complete state of a script suspended at `input()`.
///
/// Owns everything needed to continue: the program, the heap, globals, and
/// the frame stack. Consumed by [`Snapshot::run`]; if the script suspends
/// again, the returned [`RunProgress`] carries the next snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    program: Program,
    vm: VMSnapshot,
    heap: Heap,
    globals: Vec<Value>,
    max_frame_depth: usize,
}

impl Snapshot {
    /// Continues execution with `input` as the result of the pending
    /// `input()` call.
    pub fn run(mut self, input: &str, print: &mut dyn PrintWriter) -> Result<RunProgress, Exception> {
        let mut vm = VM::from_snapshot(
            &self.program,
            &mut self.heap,
            &mut self.globals,
            print,
            self.vm,
            self.max_frame_depth,
        );
        match vm.resume(input) {
            Ok(VMExit::Done) => Ok(RunProgress::Complete),
            Ok(VMExit::InputRequest) => {
                self.vm = vm.into_snapshot();
                Ok(RunProgress::InputRequest(self))
            }
            Err(e) => Err(Exception::from(e)),
        }
    }

    /// Serializes the snapshot behind a magic/version header.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        encode_payload(SNAPSHOT_MAGIC, self)
    }

    /// Restores a snapshot persisted by [`Snapshot::dump`].
    ///
    /// Rejects payloads with the wrong magic or version, payloads that fail
    /// to deserialize, and payloads whose execution state refers outside its
    /// own heap and program tables.
    pub fn load(bytes: &[u8]) -> Result<Self, DecodeError> {
        let snapshot: Self = decode_payload(SNAPSHOT_MAGIC, bytes)?;
        snapshot.check().map_err(DecodeError::Corrupt)?;
        Ok(snapshot)
    }

    /// A loaded snapshot is executed without bounds checks, so every id it
    /// carries must point inside its own tables.
    fn check(&self) -> Result<(), &'static str> {
        let heap_len = self.heap.len();
        let num_functions = self.program.functions.len();
        let num_interns = self.program.interns.count();
        if !self
            .globals
            .iter()
            .all(|v| v.refs_in_range(heap_len, num_functions, num_interns))
        {
            return Err("global refers to data out of range");
        }
        self.heap.check_ids(num_functions, num_interns)?;
        self.vm.check(&self.program, heap_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{heap::HeapData, io::NoPrint};

    fn suspended_snapshot(source: &str) -> Snapshot {
        let mut print = NoPrint;
        let runner = Runner::new(source).unwrap();
        match runner.start(&mut print).unwrap() {
            RunProgress::InputRequest(snapshot) => snapshot,
            RunProgress::Complete => panic!("script did not suspend"),
        }
    }

    #[test]
    fn load_rejects_out_of_range_heap_ids() {
        let mut snapshot = suspended_snapshot("x = input()\nprint(x)\n");

        // mint an id one past the end of the snapshot's heap
        let mut donor = Heap::new();
        let bogus = loop {
            let id = donor.allocate(HeapData::Cell(Value::None));
            if id.index() >= snapshot.heap.len() {
                break id;
            }
        };
        snapshot.globals[0] = Value::Ref(bogus);

        let bytes = snapshot.dump().unwrap();
        let err = Snapshot::load(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::Corrupt(_)), "got: {err}");
    }

    #[test]
    fn load_accepts_a_faithful_dump() {
        let snapshot = suspended_snapshot("greeting = 'hi ' * 2\nname = input()\nprint(greeting, name)\n");
        let bytes = snapshot.dump().unwrap();
        assert!(Snapshot::load(&bytes).is_ok());
    }
}
