//! The bytecode interpreter.
//!
//! The VM executes one instruction at a time over a frame stack and a shared
//! value stack. It borrows the program, heap, and globals from its caller so
//! that execution state can be lifted out into a serializable snapshot when a
//! script suspends at `input()`.

mod binary;
mod call;
mod object;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{
    code::{Code, Program},
    op::Opcode,
};
use crate::{
    exception::{ExcType, RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{FunctionId, StringId},
    value::Value,
};

/// One call frame.
///
/// `stack_base` marks where this frame's expression stack begins in the
/// shared value stack; returning truncates back to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Frame {
    /// `None` for the module frame.
    function: Option<FunctionId>,
    ip: usize,
    stack_base: usize,
    locals: Vec<Value>,
    /// Own cells first, then cells captured from the enclosing scope.
    cells: SmallVec<[HeapId; 4]>,
    /// Set while running `__init__`; the instance becomes the call result.
    init_instance: Option<Value>,
}

/// Serializable execution state of a suspended VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct VMSnapshot {
    frames: Vec<Frame>,
    stack: Vec<Value>,
}

impl VMSnapshot {
    /// Verifies that frame and stack contents stay inside the program and
    /// heap they will run against. Execution indexes both without bounds
    /// checks, so a deserialized snapshot is vetted before it is resumed.
    pub(crate) fn check(&self, program: &Program, heap_len: usize) -> Result<(), &'static str> {
        let num_functions = program.functions.len();
        let num_interns = program.interns.count();
        let value_ok = |v: &Value| v.refs_in_range(heap_len, num_functions, num_interns);
        if self.frames.is_empty() {
            return Err("snapshot has no frames");
        }
        if !self.stack.iter().all(value_ok) {
            return Err("stack value refers to data out of range");
        }
        for frame in &self.frames {
            let code = match frame.function {
                Some(fid) => {
                    let Some(def) = program.functions.get(fid.index()) else {
                        return Err("frame refers to a missing function");
                    };
                    &def.code
                }
                None => &program.module,
            };
            if frame.ip > code.bytecode().len() {
                return Err("frame instruction pointer out of range");
            }
            if !frame.locals.iter().all(value_ok) {
                return Err("frame local refers to data out of range");
            }
            if frame.cells.iter().any(|cell| cell.index() >= heap_len) {
                return Err("frame cell refers to data out of range");
            }
            if let Some(instance) = &frame.init_instance
                && !value_ok(instance)
            {
                return Err("frame instance refers to data out of range");
            }
        }
        Ok(())
    }
}

/// Why [`VM::run`] stopped.
#[derive(Debug)]
pub(crate) enum VMExit {
    /// The module frame returned.
    Done,
    /// An `input()` call needs a line from the host. Resume by pushing the
    /// input string and running again.
    InputRequest,
}

/// What a single instruction asked the run loop to do.
enum StepAction {
    Continue,
    /// A new frame was pushed; the loop must re-cache.
    Call,
    Return(Value),
    Input,
}

/// Bytecode cursor for the frame currently executing.
///
/// Holds the code reference out-of-line so the hot fetch path does not go
/// through the frame stack.
struct CachedFrame<'p> {
    code: &'p Code,
    ip: usize,
}

impl CachedFrame<'_> {
    fn fetch_u8(&mut self) -> u8 {
        let byte = self.code.bytecode().get(self.ip).copied().unwrap_or(0);
        self.ip += 1;
        byte
    }

    fn fetch_i8(&mut self) -> i8 {
        i8::from_le_bytes([self.fetch_u8()])
    }

    fn fetch_u16(&mut self) -> u16 {
        u16::from_le_bytes([self.fetch_u8(), self.fetch_u8()])
    }

    fn fetch_i16(&mut self) -> i16 {
        i16::from_le_bytes([self.fetch_u8(), self.fetch_u8()])
    }

    fn jump(&mut self, offset: i16) {
        let ip = i64::try_from(self.ip).unwrap_or(0) + i64::from(offset);
        self.ip = usize::try_from(ip).unwrap_or(0);
    }
}

pub(crate) struct VM<'p> {
    program: &'p Program,
    heap: &'p mut Heap,
    globals: &'p mut Vec<Value>,
    print: &'p mut dyn crate::io::PrintWriter,
    frames: Vec<Frame>,
    stack: Vec<Value>,
    max_frame_depth: usize,
}

impl<'p> VM<'p> {
    /// Creates a VM positioned at the start of the module code.
    pub(crate) fn new(
        program: &'p Program,
        heap: &'p mut Heap,
        globals: &'p mut Vec<Value>,
        print: &'p mut dyn crate::io::PrintWriter,
        max_frame_depth: usize,
    ) -> Self {
        let module_frame = Frame {
            function: None,
            ip: 0,
            stack_base: 0,
            locals: Vec::new(),
            cells: SmallVec::new(),
            init_instance: None,
        };
        Self {
            program,
            heap,
            globals,
            print,
            frames: vec![module_frame],
            stack: Vec::with_capacity(usize::from(program.module.max_stack_depth())),
            max_frame_depth,
        }
    }

    /// Restores a VM from a snapshot taken at an `input()` suspension.
    pub(crate) fn from_snapshot(
        program: &'p Program,
        heap: &'p mut Heap,
        globals: &'p mut Vec<Value>,
        print: &'p mut dyn crate::io::PrintWriter,
        snapshot: VMSnapshot,
        max_frame_depth: usize,
    ) -> Self {
        Self {
            program,
            heap,
            globals,
            print,
            frames: snapshot.frames,
            stack: snapshot.stack,
            max_frame_depth,
        }
    }

    /// Extracts the execution state for persistence.
    pub(crate) fn into_snapshot(self) -> VMSnapshot {
        VMSnapshot {
            frames: self.frames,
            stack: self.stack,
        }
    }

    /// Pushes the host-supplied input line and continues execution.
    pub(crate) fn resume(&mut self, input: &str) -> RunResult<VMExit> {
        let value = Value::Ref(self.heap.allocate_str(input.to_owned()));
        self.stack.push(value);
        self.run()
    }

    /// Runs until the module returns, an `input()` suspends, or an error is
    /// raised. Errors carry the span of the failing instruction.
    pub(crate) fn run(&mut self) -> RunResult<VMExit> {
        let mut cached = self.cache_frame()?;
        loop {
            let instruction_start = cached.ip;
            match self.step(&mut cached) {
                Ok(StepAction::Continue) => {}
                Ok(StepAction::Call) => {
                    cached = self.cache_frame()?;
                }
                Ok(StepAction::Return(value)) => {
                    if self.pop_frame(value) {
                        cached = self.cache_frame()?;
                    } else {
                        return Ok(VMExit::Done);
                    }
                }
                Ok(StepAction::Input) => {
                    self.sync_ip(&cached);
                    return Ok(VMExit::InputRequest);
                }
                Err(e) => {
                    return Err(match cached.code.span_at(instruction_start) {
                        Some(span) => e.with_span(span),
                        None => e,
                    });
                }
            }
        }
    }

    fn cache_frame(&mut self) -> RunResult<CachedFrame<'p>> {
        let frame = self.frame();
        let code = match frame.function {
            Some(fid) => {
                let def = self
                    .program
                    .functions
                    .get(fid.index())
                    .ok_or_else(|| RunError::new(ExcType::TypeError, "invalid function reference"))?;
                &def.code
            }
            None => &self.program.module,
        };
        Ok(CachedFrame { code, ip: frame.ip })
    }

    fn sync_ip(&mut self, cached: &CachedFrame<'_>) {
        let ip = cached.ip;
        self.frame_mut().ip = ip;
    }

    fn frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let idx = self.frames.len() - 1;
        &mut self.frames[idx]
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Undefined)
    }

    /// Pops the finished frame and pushes its result for the caller.
    ///
    /// Returns `false` when the module frame finished.
    fn pop_frame(&mut self, value: Value) -> bool {
        let Some(frame) = self.frames.pop() else {
            return false;
        };
        self.stack.truncate(frame.stack_base);
        if self.frames.is_empty() {
            return false;
        }
        let result = frame.init_instance.unwrap_or(value);
        self.stack.push(result);
        true
    }

    fn corrupt(message: &str) -> RunError {
        RunError::new(ExcType::TypeError, format!("corrupted bytecode: {message}"))
    }

    fn step(&mut self, cached: &mut CachedFrame<'p>) -> RunResult<StepAction> {
        let op_byte = cached.fetch_u8();
        let Some(op) = Opcode::from_repr(op_byte) else {
            return Err(Self::corrupt("unknown opcode"));
        };
        match op {
            Opcode::LoadConst => {
                let idx = cached.fetch_u16();
                self.stack.push(self.program.constant(usize::from(idx)));
            }
            Opcode::LoadNone => self.stack.push(Value::None),
            Opcode::LoadTrue => self.stack.push(Value::Bool(true)),
            Opcode::LoadFalse => self.stack.push(Value::Bool(false)),
            Opcode::LoadSmallInt => {
                let value = cached.fetch_i8();
                self.stack.push(Value::Int(i64::from(value)));
            }
            Opcode::Pop => {
                self.pop();
            }
            Opcode::Nop => {}
            Opcode::LoadLocal => {
                let slot = usize::from(cached.fetch_u8());
                self.load_local(cached, slot)?;
            }
            Opcode::LoadLocalW => {
                let slot = usize::from(cached.fetch_u16());
                self.load_local(cached, slot)?;
            }
            Opcode::StoreLocal => {
                let slot = usize::from(cached.fetch_u8());
                self.store_local(slot)?;
            }
            Opcode::StoreLocalW => {
                let slot = usize::from(cached.fetch_u16());
                self.store_local(slot)?;
            }
            Opcode::LoadCell => {
                let idx = usize::from(cached.fetch_u8());
                let cell = self.cell_id(idx)?;
                let HeapData::Cell(value) = self.heap.get(cell) else {
                    return Err(Self::corrupt("cell index does not point at a cell"));
                };
                if matches!(value, Value::Undefined) {
                    return Err(RunError::new(
                        ExcType::NameError,
                        "cannot access variable before it is assigned",
                    ));
                }
                let value = *value;
                self.stack.push(value);
            }
            Opcode::StoreCell => {
                let idx = usize::from(cached.fetch_u8());
                let value = self.pop();
                let cell = self.cell_id(idx)?;
                *self.heap.get_mut(cell) = HeapData::Cell(value);
            }
            Opcode::LoadGlobal => {
                let slot = usize::from(cached.fetch_u16());
                let value = self.globals.get(slot).copied().unwrap_or(Value::Undefined);
                if matches!(value, Value::Undefined) {
                    let name = self
                        .program
                        .global_names
                        .get(slot)
                        .map_or("", |&id| self.program.interns.get(id));
                    return Err(RunError::name_error(name));
                }
                self.stack.push(value);
            }
            Opcode::StoreGlobal => {
                let slot = usize::from(cached.fetch_u16());
                let value = self.pop();
                let Some(dst) = self.globals.get_mut(slot) else {
                    return Err(Self::corrupt("global slot out of range"));
                };
                *dst = value;
            }
            Opcode::LoadAttr => {
                let name = StringId::from_u16(cached.fetch_u16());
                let obj = self.pop();
                let value = self.load_attr(obj, name)?;
                self.stack.push(value);
            }
            Opcode::StoreAttr => {
                let name = StringId::from_u16(cached.fetch_u16());
                let obj = self.pop();
                let value = self.pop();
                self.store_attr(obj, name, value)?;
            }
            Opcode::LoadIndex => {
                let key = self.pop();
                let obj = self.pop();
                let value = self.load_index(obj, key)?;
                self.stack.push(value);
            }
            Opcode::StoreIndex => {
                let key = self.pop();
                let obj = self.pop();
                let value = self.pop();
                self.store_index(obj, key, value)?;
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::FloorDiv
            | Opcode::Mod
            | Opcode::CompareEq
            | Opcode::CompareNe
            | Opcode::CompareLt
            | Opcode::CompareLe
            | Opcode::CompareGt
            | Opcode::CompareGe => {
                let right = self.pop();
                let left = self.pop();
                let value = self.binary_op(op, left, right)?;
                self.stack.push(value);
            }
            Opcode::UnaryNeg => {
                let value = self.pop();
                let Some(n) = value.as_number() else {
                    return Err(RunError::type_error(format!(
                        "bad operand type for unary -: '{}'",
                        value.type_name(self.heap, &self.program.interns)
                    )));
                };
                self.stack.push(Value::Int(n.wrapping_neg()));
            }
            Opcode::UnaryNot => {
                let value = self.pop();
                let truthy = value.is_truthy(self.heap, &self.program.interns);
                self.stack.push(Value::Bool(!truthy));
            }
            Opcode::Jump => {
                let offset = cached.fetch_i16();
                cached.jump(offset);
            }
            Opcode::JumpIfFalse => {
                let offset = cached.fetch_i16();
                let value = self.pop();
                if !value.is_truthy(self.heap, &self.program.interns) {
                    cached.jump(offset);
                }
            }
            Opcode::JumpIfTrue => {
                let offset = cached.fetch_i16();
                let value = self.pop();
                if value.is_truthy(self.heap, &self.program.interns) {
                    cached.jump(offset);
                }
            }
            Opcode::JumpIfFalseOrPop => {
                let offset = cached.fetch_i16();
                let value = self.stack.last().copied().unwrap_or(Value::Undefined);
                if value.is_truthy(self.heap, &self.program.interns) {
                    self.pop();
                } else {
                    cached.jump(offset);
                }
            }
            Opcode::JumpIfTrueOrPop => {
                let offset = cached.fetch_i16();
                let value = self.stack.last().copied().unwrap_or(Value::Undefined);
                if value.is_truthy(self.heap, &self.program.interns) {
                    cached.jump(offset);
                } else {
                    self.pop();
                }
            }
            Opcode::GetIter => {
                let obj = self.pop();
                let id = self.get_iter(obj)?;
                self.stack.push(Value::Ref(id));
            }
            Opcode::ForIter => {
                let offset = cached.fetch_i16();
                let top = self.stack.last().copied().unwrap_or(Value::Undefined);
                let Value::Ref(id) = top else {
                    return Err(Self::corrupt("for-loop target is not an iterator"));
                };
                let interns = &self.program.interns;
                match self.heap.iter_next(id, |sid| interns.get(sid).to_owned())? {
                    Some(value) => self.stack.push(value),
                    None => {
                        self.pop();
                        cached.jump(offset);
                    }
                }
            }
            Opcode::CallFunction => {
                let argc = usize::from(cached.fetch_u8());
                let action = self.call_function(cached, argc)?;
                return Ok(action);
            }
            Opcode::CallBuiltin => {
                let builtin_id = cached.fetch_u8();
                let argc = usize::from(cached.fetch_u8());
                self.call_builtin(builtin_id, argc)?;
            }
            Opcode::CallMethod => {
                let name = StringId::from_u16(cached.fetch_u16());
                let argc = usize::from(cached.fetch_u8());
                let action = self.call_method(cached, name, argc)?;
                return Ok(action);
            }
            Opcode::ReturnValue => {
                let value = self.pop();
                if self.frame().init_instance.is_some() && !matches!(value, Value::None) {
                    return Err(RunError::type_error(format!(
                        "__init__() should return None, not '{}'",
                        value.type_name(self.heap, &self.program.interns)
                    )));
                }
                self.sync_ip(cached);
                return Ok(StepAction::Return(value));
            }
            Opcode::BuildList => {
                let count = usize::from(cached.fetch_u16());
                let start = self.stack.len().saturating_sub(count);
                let items = self.stack.split_off(start);
                let id = self.heap.allocate(HeapData::List(items));
                self.stack.push(Value::Ref(id));
            }
            Opcode::BuildDict => {
                let count = usize::from(cached.fetch_u16());
                self.build_dict(count)?;
            }
            Opcode::BuildClass => {
                let name = StringId::from_u16(cached.fetch_u16());
                let method_count = usize::from(cached.fetch_u8());
                let mut methods = indexmap::IndexMap::default();
                for _ in 0..method_count {
                    let method_name = StringId::from_u16(cached.fetch_u16());
                    let function = FunctionId(cached.fetch_u16());
                    methods.insert(method_name, function);
                }
                let id = self.heap.allocate(HeapData::Class(crate::heap::Class { name, methods }));
                self.stack.push(Value::Ref(id));
            }
            Opcode::MakeFunction => {
                let function = FunctionId(cached.fetch_u16());
                self.stack.push(Value::Function(function));
            }
            Opcode::MakeClosure => {
                let function = FunctionId(cached.fetch_u16());
                let capture_count = usize::from(cached.fetch_u8());
                let mut captured = SmallVec::new();
                for _ in 0..capture_count {
                    let idx = usize::from(cached.fetch_u8());
                    captured.push(self.cell_id(idx)?);
                }
                let id = self
                    .heap
                    .allocate(HeapData::Closure(crate::heap::Closure { function, captured }));
                self.stack.push(Value::Ref(id));
            }
            Opcode::Input => {
                let has_prompt = cached.fetch_u8() != 0;
                if has_prompt {
                    let prompt = self.pop();
                    let text = prompt.py_str(self.heap, &self.program.interns);
                    self.print.stdout_write(std::borrow::Cow::Owned(text));
                }
                return Ok(StepAction::Input);
            }
        }
        Ok(StepAction::Continue)
    }

    fn load_local(&mut self, cached: &CachedFrame<'_>, slot: usize) -> RunResult<()> {
        let value = self.frame().locals.get(slot).copied().unwrap_or(Value::Undefined);
        if matches!(value, Value::Undefined) {
            let name = cached
                .code
                .local_name(slot)
                .map_or("", |id| self.program.interns.get(id));
            return Err(RunError::name_error(name));
        }
        self.stack.push(value);
        Ok(())
    }

    fn store_local(&mut self, slot: usize) -> RunResult<()> {
        let value = self.pop();
        let Some(dst) = self.frame_mut().locals.get_mut(slot) else {
            return Err(Self::corrupt("local slot out of range"));
        };
        *dst = value;
        Ok(())
    }

    fn cell_id(&self, idx: usize) -> RunResult<HeapId> {
        self.frame()
            .cells
            .get(idx)
            .copied()
            .ok_or_else(|| Self::corrupt("cell index out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bytecode::compile, io::NoPrint};

    #[test]
    fn new_vm_reserves_the_module_stack() {
        let program = compile("x = [1, 2, 3, 4, 5]\n").unwrap();
        let mut heap = Heap::new();
        let mut globals = vec![Value::Undefined; program.global_names.len()];
        let mut print = NoPrint;
        let vm = VM::new(&program, &mut heap, &mut globals, &mut print, 16);
        assert!(program.module.max_stack_depth() >= 5);
        assert!(vm.stack.capacity() >= usize::from(program.module.max_stack_depth()));
    }
}
