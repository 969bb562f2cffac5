//! Calls: user functions and closures, class instantiation, builtins, and
//! the native methods of lists, dicts, and strings.

use std::borrow::Cow;

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::{CachedFrame, Frame, StepAction, VM, object::resolve_index};
use crate::{
    builtins::Builtin,
    exception::{RunError, RunResult},
    heap::{HeapData, HeapId, Instance},
    intern::{FunctionId, StringId},
    value::{DictKey, Value},
};

impl<'p> VM<'p> {
    pub(super) fn call_function(&mut self, cached: &CachedFrame<'p>, argc: usize) -> RunResult<StepAction> {
        let callee_idx = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| Self::corrupt("call without callee"))?;
        let callee = self.stack[callee_idx];
        match callee {
            Value::Function(fid) => {
                self.sync_ip(cached);
                self.push_frame(fid, &[], argc, &[], None)?;
                Ok(StepAction::Call)
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(closure) => {
                    let function = closure.function;
                    let captured = closure.captured.clone();
                    self.sync_ip(cached);
                    self.push_frame(function, &[], argc, &captured, None)?;
                    Ok(StepAction::Call)
                }
                HeapData::Class(_) => self.instantiate(cached, id, argc),
                _ => Err(self.not_callable(callee)),
            },
            _ => Err(self.not_callable(callee)),
        }
    }

    /// Allocates an instance and runs `__init__` when the class defines one.
    fn instantiate(&mut self, cached: &CachedFrame<'p>, class_id: HeapId, argc: usize) -> RunResult<StepAction> {
        let program = self.program;
        let HeapData::Class(class) = self.heap.get(class_id) else {
            return Err(Self::corrupt("instantiating a non-class"));
        };
        let class_name = program.interns.get(class.name);
        let init = class
            .methods
            .iter()
            .find(|&(&name, _)| program.interns.get(name) == "__init__")
            .map(|(_, &fid)| fid);

        let instance = Value::Ref(self.heap.allocate(HeapData::Instance(Instance {
            class: class_id,
            fields: IndexMap::default(),
        })));

        match init {
            Some(fid) => {
                self.sync_ip(cached);
                self.push_frame(fid, &[instance], argc, &[], Some(instance))?;
                Ok(StepAction::Call)
            }
            None => {
                if argc != 0 {
                    return Err(RunError::type_error(format!("{class_name}() takes no arguments")));
                }
                // replace the class value with the instance
                self.pop();
                self.stack.push(instance);
                Ok(StepAction::Continue)
            }
        }
    }

    pub(super) fn call_method(&mut self, cached: &CachedFrame<'p>, name: StringId, argc: usize) -> RunResult<StepAction> {
        let recv_idx = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| Self::corrupt("method call without receiver"))?;
        let receiver = self.stack[recv_idx];

        if let Value::Ref(id) = receiver
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            let program = self.program;
            let HeapData::Class(class) = self.heap.get(instance.class) else {
                return Err(Self::corrupt("instance of a non-class"));
            };
            let Some(&fid) = class.methods.get(&name) else {
                return Err(RunError::attribute_error(
                    program.interns.get(class.name),
                    program.interns.get(name),
                ));
            };
            self.sync_ip(cached);
            self.push_frame(fid, &[receiver], argc, &[], None)?;
            return Ok(StepAction::Call);
        }

        let args: SmallVec<[Value; 4]> = self.stack[recv_idx + 1..].iter().copied().collect();
        let result = self.native_method(receiver, name, &args)?;
        self.stack.truncate(recv_idx);
        self.stack.push(result);
        Ok(StepAction::Continue)
    }

    /// Pushes a call frame.
    ///
    /// `prefix` values (the receiver or a fresh instance) fill the leading
    /// parameter slots, then `argc` arguments move off the stack. The slot
    /// below the arguments (callee, receiver, or class) is popped.
    fn push_frame(
        &mut self,
        function: FunctionId,
        prefix: &[Value],
        argc: usize,
        captured: &[HeapId],
        init_instance: Option<Value>,
    ) -> RunResult<()> {
        if self.frames.len() >= self.max_frame_depth {
            return Err(RunError::recursion());
        }
        let program = self.program;
        let def = program
            .functions
            .get(function.index())
            .ok_or_else(|| Self::corrupt("invalid function id"))?;
        let supplied = prefix.len() + argc;
        if usize::from(def.num_params) != supplied {
            return Err(RunError::type_error_arg_count(
                program.interns.get(def.name),
                usize::from(def.num_params),
                supplied,
            ));
        }
        let mut locals = vec![Value::Undefined; usize::from(def.code.num_locals())];
        if locals.len() < supplied {
            return Err(Self::corrupt("fewer local slots than parameters"));
        }
        locals[..prefix.len()].copy_from_slice(prefix);
        let args_start = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or_else(|| Self::corrupt("missing call arguments"))?;
        for (i, value) in self.stack.drain(args_start..).enumerate() {
            locals[prefix.len() + i] = value;
        }
        self.pop();
        self.stack.reserve(usize::from(def.code.max_stack_depth()));
        let mut cells: SmallVec<[HeapId; 4]> = SmallVec::new();
        for _ in 0..def.num_own_cells {
            cells.push(self.heap.allocate(HeapData::Cell(Value::Undefined)));
        }
        cells.extend_from_slice(captured);
        self.frames.push(Frame {
            function: Some(function),
            ip: 0,
            stack_base: self.stack.len(),
            locals,
            cells,
            init_instance,
        });
        Ok(())
    }

    fn not_callable(&self, value: Value) -> RunError {
        RunError::type_error_not_callable(&value.type_name(self.heap, &self.program.interns))
    }

    // --- builtins ---

    pub(super) fn call_builtin(&mut self, builtin_id: u8, argc: usize) -> RunResult<()> {
        let Some(builtin) = Builtin::from_repr(builtin_id) else {
            return Err(Self::corrupt("unknown builtin id"));
        };
        let start = self.stack.len().saturating_sub(argc);
        let args: SmallVec<[Value; 4]> = self.stack[start..].iter().copied().collect();
        self.stack.truncate(start);
        let result = match builtin {
            Builtin::Print => self.builtin_print(&args),
            Builtin::Len => self.builtin_len(&args)?,
            Builtin::Range => self.builtin_range(&args)?,
            Builtin::Int => self.builtin_int(&args)?,
            Builtin::Str => self.builtin_str(&args)?,
            Builtin::Bool => self.builtin_bool(&args)?,
        };
        self.stack.push(result);
        Ok(())
    }

    fn builtin_print(&mut self, args: &[Value]) -> Value {
        let program = self.program;
        let mut out = String::new();
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(&arg.py_str(self.heap, &program.interns));
        }
        self.print.stdout_write(Cow::Owned(out));
        self.print.stdout_push('\n');
        Value::None
    }

    fn builtin_len(&mut self, args: &[Value]) -> RunResult<Value> {
        let [arg] = args else {
            return Err(RunError::type_error(format!(
                "{}() takes exactly one argument ({} given)",
                Builtin::Len.name(),
                args.len()
            )));
        };
        let program = self.program;
        if let Some(s) = arg.as_str(self.heap, &program.interns) {
            let count = i64::try_from(s.chars().count()).unwrap_or(i64::MAX);
            return Ok(Value::Int(count));
        }
        if let Value::Ref(id) = arg {
            let len = match self.heap.get(*id) {
                HeapData::List(items) => Some(i64::try_from(items.len()).unwrap_or(i64::MAX)),
                HeapData::Dict(entries) => Some(i64::try_from(entries.len()).unwrap_or(i64::MAX)),
                HeapData::Range { start, stop, step } => Some(range_len(*start, *stop, *step)),
                _ => None,
            };
            if let Some(len) = len {
                return Ok(Value::Int(len));
            }
        }
        Err(RunError::type_error(format!(
            "object of type '{}' has no len()",
            arg.type_name(self.heap, &program.interns)
        )))
    }

    fn builtin_range(&mut self, args: &[Value]) -> RunResult<Value> {
        if args.is_empty() {
            return Err(RunError::type_error(format!(
                "{} expected at least 1 argument, got 0",
                Builtin::Range.name()
            )));
        }
        if args.len() > 3 {
            return Err(RunError::type_error(format!(
                "{} expected at most 3 arguments, got {}",
                Builtin::Range.name(),
                args.len()
            )));
        }
        let mut numbers = [0i64; 3];
        for (slot, arg) in numbers.iter_mut().zip(args) {
            let Some(n) = arg.as_number() else {
                return Err(RunError::type_error(format!(
                    "'{}' object cannot be interpreted as an integer",
                    arg.type_name(self.heap, &self.program.interns)
                )));
            };
            *slot = n;
        }
        let (start, stop, step) = match args.len() {
            1 => (0, numbers[0], 1),
            2 => (numbers[0], numbers[1], 1),
            _ => (numbers[0], numbers[1], numbers[2]),
        };
        if step == 0 {
            return Err(RunError::value_error(format!(
                "{}() arg 3 must not be zero",
                Builtin::Range.name()
            )));
        }
        Ok(Value::Ref(self.heap.allocate(HeapData::Range { start, stop, step })))
    }

    fn builtin_int(&mut self, args: &[Value]) -> RunResult<Value> {
        match args {
            [] => Ok(Value::Int(0)),
            [arg] => {
                if let Some(n) = arg.as_number() {
                    return Ok(Value::Int(n));
                }
                let program = self.program;
                if let Some(s) = arg.as_str(self.heap, &program.interns) {
                    return s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        RunError::value_error(format!(
                            "invalid literal for int() with base 10: {}",
                            arg.py_repr(self.heap, &program.interns)
                        ))
                    });
                }
                Err(RunError::type_error(format!(
                    "int() argument must be a string or a number, not '{}'",
                    arg.type_name(self.heap, &program.interns)
                )))
            }
            _ => Err(RunError::type_error(format!(
                "{}() takes at most 1 argument ({} given)",
                Builtin::Int.name(),
                args.len()
            ))),
        }
    }

    fn builtin_str(&mut self, args: &[Value]) -> RunResult<Value> {
        match args {
            [] => Ok(Value::Ref(self.heap.allocate_str(String::new()))),
            [arg] => {
                let program = self.program;
                if arg.as_str(self.heap, &program.interns).is_some() {
                    return Ok(*arg);
                }
                let text = arg.py_str(self.heap, &program.interns);
                Ok(Value::Ref(self.heap.allocate_str(text)))
            }
            _ => Err(RunError::type_error(format!(
                "{}() takes at most 1 argument ({} given)",
                Builtin::Str.name(),
                args.len()
            ))),
        }
    }

    fn builtin_bool(&mut self, args: &[Value]) -> RunResult<Value> {
        match args {
            [] => Ok(Value::Bool(false)),
            [arg] => Ok(Value::Bool(arg.is_truthy(self.heap, &self.program.interns))),
            _ => Err(RunError::type_error(format!(
                "{}() takes at most 1 argument ({} given)",
                Builtin::Bool.name(),
                args.len()
            ))),
        }
    }

    // --- native methods ---

    fn native_method(&mut self, receiver: Value, name: StringId, args: &[Value]) -> RunResult<Value> {
        let program = self.program;
        let method = program.interns.get(name);
        if receiver.as_str(self.heap, &program.interns).is_some() {
            return self.str_method(receiver, method, args);
        }
        if let Value::Ref(id) = receiver {
            match self.heap.get(id) {
                HeapData::List(_) => return self.list_method(id, method, args),
                HeapData::Dict(_) => return self.dict_method(id, method, args),
                _ => {}
            }
        }
        Err(RunError::attribute_error(
            &receiver.type_name(self.heap, &program.interns),
            method,
        ))
    }

    fn list_method(&mut self, id: HeapId, method: &str, args: &[Value]) -> RunResult<Value> {
        let program = self.program;
        match (method, args) {
            ("append", [value]) => {
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.push(*value);
                }
                Ok(Value::None)
            }
            ("pop", []) => {
                let HeapData::List(items) = self.heap.get_mut(id) else {
                    return Err(Self::corrupt("list receiver changed type"));
                };
                items
                    .pop()
                    .ok_or_else(|| RunError::new(crate::exception::ExcType::IndexError, "pop from empty list"))
            }
            ("pop", [index]) => {
                let Some(idx) = index.as_number() else {
                    return Err(RunError::type_error("list.pop() index must be an integer"));
                };
                let HeapData::List(items) = self.heap.get_mut(id) else {
                    return Err(Self::corrupt("list receiver changed type"));
                };
                let slot = resolve_index(items.len(), idx).ok_or_else(|| {
                    RunError::new(crate::exception::ExcType::IndexError, "pop index out of range")
                })?;
                Ok(items.remove(slot))
            }
            ("insert", [index, value]) => {
                let Some(idx) = index.as_number() else {
                    return Err(RunError::type_error("list.insert() index must be an integer"));
                };
                let HeapData::List(items) = self.heap.get_mut(id) else {
                    return Err(Self::corrupt("list receiver changed type"));
                };
                // out-of-range indices clamp instead of raising
                let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                let slot = if idx < 0 { (idx + len).max(0) } else { idx.min(len) };
                let slot = usize::try_from(slot).unwrap_or(0);
                items.insert(slot, *value);
                Ok(Value::None)
            }
            ("remove", [value]) => {
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(Self::corrupt("list receiver changed type"));
                };
                let found = items
                    .iter()
                    .position(|item| value.py_eq(item, self.heap, &program.interns));
                let Some(slot) = found else {
                    return Err(RunError::value_error("list.remove(x): x not in list"));
                };
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.remove(slot);
                }
                Ok(Value::None)
            }
            ("reverse", []) => {
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.reverse();
                }
                Ok(Value::None)
            }
            ("sort", []) => self.sort_list(id),
            ("clear", []) => {
                if let HeapData::List(items) = self.heap.get_mut(id) {
                    items.clear();
                }
                Ok(Value::None)
            }
            ("index", [value]) => {
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(Self::corrupt("list receiver changed type"));
                };
                let found = items
                    .iter()
                    .position(|item| value.py_eq(item, self.heap, &program.interns));
                match found {
                    Some(slot) => Ok(Value::Int(i64::try_from(slot).unwrap_or(i64::MAX))),
                    None => Err(RunError::value_error(format!(
                        "{} is not in list",
                        value.py_repr(self.heap, &program.interns)
                    ))),
                }
            }
            ("count", [value]) => {
                let HeapData::List(items) = self.heap.get(id) else {
                    return Err(Self::corrupt("list receiver changed type"));
                };
                let count = items
                    .iter()
                    .filter(|item| value.py_eq(item, self.heap, &program.interns))
                    .count();
                Ok(Value::Int(i64::try_from(count).unwrap_or(i64::MAX)))
            }
            ("append" | "pop" | "insert" | "remove" | "reverse" | "sort" | "clear" | "index" | "count", _) => {
                Err(RunError::type_error(format!(
                    "list.{method}() called with {} arguments",
                    args.len()
                )))
            }
            _ => Err(RunError::attribute_error("list", method)),
        }
    }

    /// Sorts in place. Lists must be all numbers or all strings; anything
    /// mixed raises the comparison error Python would.
    fn sort_list(&mut self, id: HeapId) -> RunResult<Value> {
        let program = self.program;
        let HeapData::List(items) = self.heap.get(id) else {
            return Err(Self::corrupt("list receiver changed type"));
        };
        if items.iter().all(|v| v.as_number().is_some()) {
            if let HeapData::List(items) = self.heap.get_mut(id) {
                items.sort_by_key(|v| v.as_number().unwrap_or(0));
            }
            return Ok(Value::None);
        }
        if items.iter().all(|v| v.as_str(self.heap, &program.interns).is_some()) {
            let mut keyed: Vec<(String, Value)> = items
                .iter()
                .map(|v| (v.as_str(self.heap, &program.interns).unwrap_or("").to_owned(), *v))
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            let sorted: Vec<Value> = keyed.into_iter().map(|(_, v)| v).collect();
            if let HeapData::List(items) = self.heap.get_mut(id) {
                *items = sorted;
            }
            return Ok(Value::None);
        }
        let first = items.first().copied().unwrap_or(Value::None);
        let first_kind = first.as_number().is_some();
        let other = items
            .iter()
            .find(|v| v.as_number().is_some() != first_kind)
            .copied()
            .unwrap_or(Value::None);
        Err(RunError::type_error_compare(
            "<",
            &other.type_name(self.heap, &program.interns),
            &first.type_name(self.heap, &program.interns),
        ))
    }

    fn dict_method(&mut self, id: HeapId, method: &str, args: &[Value]) -> RunResult<Value> {
        let program = self.program;
        match (method, args) {
            ("get", [key] | [key, _]) => {
                let dict_key = DictKey::from_value(key, self.heap, &program.interns)?;
                let HeapData::Dict(entries) = self.heap.get(id) else {
                    return Err(Self::corrupt("dict receiver changed type"));
                };
                match entries.get(&dict_key) {
                    Some(&value) => Ok(value),
                    None => Ok(args.get(1).copied().unwrap_or(Value::None)),
                }
            }
            ("keys", []) => {
                let HeapData::Dict(entries) = self.heap.get(id) else {
                    return Err(Self::corrupt("dict receiver changed type"));
                };
                let keys: Vec<DictKey> = entries.keys().cloned().collect();
                let values: Vec<Value> = keys.into_iter().map(|k| k.into_value(self.heap)).collect();
                Ok(Value::Ref(self.heap.allocate(HeapData::List(values))))
            }
            ("values", []) => {
                let HeapData::Dict(entries) = self.heap.get(id) else {
                    return Err(Self::corrupt("dict receiver changed type"));
                };
                let values: Vec<Value> = entries.values().copied().collect();
                Ok(Value::Ref(self.heap.allocate(HeapData::List(values))))
            }
            ("clear", []) => {
                if let HeapData::Dict(entries) = self.heap.get_mut(id) {
                    entries.clear();
                }
                Ok(Value::None)
            }
            ("get" | "keys" | "values" | "clear", _) => Err(RunError::type_error(format!(
                "dict.{method}() called with {} arguments",
                args.len()
            ))),
            _ => Err(RunError::attribute_error("dict", method)),
        }
    }

    fn str_method(&mut self, receiver: Value, method: &str, args: &[Value]) -> RunResult<Value> {
        let program = self.program;
        let Some(s) = receiver.as_str(self.heap, &program.interns) else {
            return Err(Self::corrupt("string receiver changed type"));
        };
        match (method, args) {
            ("upper", []) => {
                let out = s.to_uppercase();
                Ok(Value::Ref(self.heap.allocate_str(out)))
            }
            ("lower", []) => {
                let out = s.to_lowercase();
                Ok(Value::Ref(self.heap.allocate_str(out)))
            }
            ("strip", []) => {
                let out = s.trim().to_owned();
                Ok(Value::Ref(self.heap.allocate_str(out)))
            }
            ("split", []) => {
                let parts: Vec<String> = s.split_whitespace().map(str::to_owned).collect();
                self.alloc_str_list(parts)
            }
            ("split", [sep]) => {
                let Some(sep) = sep.as_str(self.heap, &program.interns) else {
                    return Err(RunError::type_error("separator must be a string"));
                };
                if sep.is_empty() {
                    return Err(RunError::value_error("empty separator"));
                }
                let parts: Vec<String> = s.split(sep).map(str::to_owned).collect();
                self.alloc_str_list(parts)
            }
            ("join", [seq]) => {
                let Value::Ref(seq_id) = seq else {
                    return Err(RunError::type_error("can only join an iterable of strings"));
                };
                let HeapData::List(items) = self.heap.get(*seq_id) else {
                    return Err(RunError::type_error("can only join an iterable of strings"));
                };
                let mut parts = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let Some(part) = item.as_str(self.heap, &program.interns) else {
                        return Err(RunError::type_error(format!(
                            "sequence item {i}: expected str instance, '{}' found",
                            item.type_name(self.heap, &program.interns)
                        )));
                    };
                    parts.push(part);
                }
                let joined = parts.join(s);
                Ok(Value::Ref(self.heap.allocate_str(joined)))
            }
            ("replace", [old, new]) => {
                let old_new = (
                    old.as_str(self.heap, &program.interns),
                    new.as_str(self.heap, &program.interns),
                );
                let (Some(old), Some(new)) = old_new else {
                    return Err(RunError::type_error("replace arguments must be strings"));
                };
                let out = s.replace(old, new);
                Ok(Value::Ref(self.heap.allocate_str(out)))
            }
            ("startswith", [prefix]) => {
                let Some(prefix) = prefix.as_str(self.heap, &program.interns) else {
                    return Err(RunError::type_error("startswith argument must be a string"));
                };
                Ok(Value::Bool(s.starts_with(prefix)))
            }
            ("endswith", [suffix]) => {
                let Some(suffix) = suffix.as_str(self.heap, &program.interns) else {
                    return Err(RunError::type_error("endswith argument must be a string"));
                };
                Ok(Value::Bool(s.ends_with(suffix)))
            }
            ("find", [needle]) => {
                let Some(needle) = needle.as_str(self.heap, &program.interns) else {
                    return Err(RunError::type_error("find argument must be a string"));
                };
                let found = match s.find(needle) {
                    Some(pos) => i64::try_from(s[..pos].chars().count()).unwrap_or(i64::MAX),
                    None => -1,
                };
                Ok(Value::Int(found))
            }
            (
                "upper" | "lower" | "strip" | "split" | "join" | "replace" | "startswith" | "endswith" | "find",
                _,
            ) => Err(RunError::type_error(format!(
                "str.{method}() called with {} arguments",
                args.len()
            ))),
            _ => Err(RunError::attribute_error("str", method)),
        }
    }

    fn alloc_str_list(&mut self, parts: Vec<String>) -> RunResult<Value> {
        let values: Vec<Value> = parts
            .into_iter()
            .map(|part| Value::Ref(self.heap.allocate_str(part)))
            .collect();
        Ok(Value::Ref(self.heap.allocate(HeapData::List(values))))
    }
}

/// Number of values a range produces.
fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        if stop > start {
            (stop - start + step - 1) / step
        } else {
            0
        }
    } else if start > stop {
        let step = -step;
        (start - stop + step - 1) / step
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_matches_python() {
        assert_eq!(range_len(0, 5, 1), 5);
        assert_eq!(range_len(0, 5, 2), 3);
        assert_eq!(range_len(5, 0, -1), 5);
        assert_eq!(range_len(5, 0, -2), 3);
        assert_eq!(range_len(0, 0, 1), 0);
        assert_eq!(range_len(5, 0, 1), 0);
    }
}
