//! Attribute access, subscripting, and iteration.

use super::VM;
use crate::{
    exception::{RunError, RunResult},
    heap::{HeapData, HeapId, Iter, PyDict},
    intern::StringId,
    value::{DictKey, Value},
};

impl VM<'_> {
    pub(super) fn load_attr(&mut self, obj: Value, name: StringId) -> RunResult<Value> {
        if let Value::Ref(id) = obj
            && let HeapData::Instance(instance) = self.heap.get(id)
        {
            if let Some(&value) = instance.fields.get(&name) {
                return Ok(value);
            }
            // methods are only reachable through calls, not as values
        }
        Err(RunError::attribute_error(
            &obj.type_name(self.heap, &self.program.interns),
            self.program.interns.get(name),
        ))
    }

    pub(super) fn store_attr(&mut self, obj: Value, name: StringId, value: Value) -> RunResult<()> {
        if let Value::Ref(id) = obj {
            if let HeapData::Instance(instance) = self.heap.get_mut(id) {
                instance.fields.insert(name, value);
                return Ok(());
            }
        }
        Err(RunError::attribute_error(
            &obj.type_name(self.heap, &self.program.interns),
            self.program.interns.get(name),
        ))
    }

    pub(super) fn load_index(&mut self, obj: Value, key: Value) -> RunResult<Value> {
        let interns = &self.program.interns;
        if let Some(s) = obj.as_str(self.heap, interns) {
            let Some(idx) = key.as_number() else {
                return Err(RunError::type_error(format!(
                    "string indices must be integers, not '{}'",
                    key.type_name(self.heap, interns)
                )));
            };
            let Some(c) = char_at(s, idx) else {
                return Err(RunError::new(
                    crate::exception::ExcType::IndexError,
                    "string index out of range",
                ));
            };
            let text = c.to_string();
            return Ok(Value::Ref(self.heap.allocate_str(text)));
        }
        if let Value::Ref(id) = obj {
            match self.heap.get(id) {
                HeapData::List(items) => {
                    let Some(idx) = key.as_number() else {
                        return Err(RunError::type_error(format!(
                            "list indices must be integers, not '{}'",
                            key.type_name(self.heap, interns)
                        )));
                    };
                    return resolve_index(items.len(), idx)
                        .and_then(|i| items.get(i).copied())
                        .ok_or_else(RunError::index_error);
                }
                HeapData::Dict(entries) => {
                    let dict_key = DictKey::from_value(&key, self.heap, interns)?;
                    return entries
                        .get(&dict_key)
                        .copied()
                        .ok_or_else(|| RunError::key_error(dict_key.repr()));
                }
                _ => {}
            }
        }
        Err(RunError::type_error(format!(
            "'{}' object is not subscriptable",
            obj.type_name(self.heap, interns)
        )))
    }

    pub(super) fn store_index(&mut self, obj: Value, key: Value, value: Value) -> RunResult<()> {
        let interns = &self.program.interns;
        if let Value::Ref(id) = obj {
            match self.heap.get(id) {
                HeapData::List(items) => {
                    let len = items.len();
                    let Some(idx) = key.as_number() else {
                        return Err(RunError::type_error(format!(
                            "list indices must be integers, not '{}'",
                            key.type_name(self.heap, interns)
                        )));
                    };
                    let slot = resolve_index(len, idx).ok_or_else(RunError::index_error)?;
                    if let HeapData::List(items) = self.heap.get_mut(id) {
                        items[slot] = value;
                    }
                    return Ok(());
                }
                HeapData::Dict(_) => {
                    let dict_key = DictKey::from_value(&key, self.heap, interns)?;
                    if let HeapData::Dict(entries) = self.heap.get_mut(id) {
                        entries.insert(dict_key, value);
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(RunError::type_error(format!(
            "'{}' object does not support item assignment",
            obj.type_name(self.heap, interns)
        )))
    }

    /// Turns an iterable into a live iterator on the heap.
    ///
    /// Iterators pass through unchanged, so `for` over an explicit iterator
    /// keeps its position.
    pub(super) fn get_iter(&mut self, obj: Value) -> RunResult<HeapId> {
        match obj {
            Value::InternString(id) => Ok(self.heap.allocate(HeapData::Iter(Iter::InternStr {
                string: id,
                index: 0,
            }))),
            Value::Ref(id) => {
                let iter = match self.heap.get(id) {
                    HeapData::List(_) => Iter::List { list: id, index: 0 },
                    HeapData::Str(_) => Iter::Str { string: id, index: 0 },
                    HeapData::Range { start, stop, step } => Iter::Range {
                        next: *start,
                        stop: *stop,
                        step: *step,
                    },
                    HeapData::Dict(entries) => Iter::Keys {
                        keys: entries.keys().cloned().collect(),
                        index: 0,
                    },
                    HeapData::Iter(_) => return Ok(id),
                    _ => return Err(self.not_iterable(obj)),
                };
                Ok(self.heap.allocate(HeapData::Iter(iter)))
            }
            _ => Err(self.not_iterable(obj)),
        }
    }

    fn not_iterable(&self, obj: Value) -> RunError {
        RunError::type_error(format!(
            "'{}' object is not iterable",
            obj.type_name(self.heap, &self.program.interns)
        ))
    }

    /// Pops `count` key-value pairs and pushes the dict. Duplicate keys keep
    /// the last value, like dict literals in Python.
    pub(super) fn build_dict(&mut self, count: usize) -> RunResult<()> {
        let start = self.stack.len().saturating_sub(count * 2);
        let items = self.stack.split_off(start);
        let mut entries = PyDict::default();
        for pair in items.chunks(2) {
            let [key, value] = pair else {
                return Err(Self::corrupt("dict entry missing value"));
            };
            let dict_key = DictKey::from_value(key, self.heap, &self.program.interns)?;
            entries.insert(dict_key, *value);
        }
        let id = self.heap.allocate(HeapData::Dict(entries));
        self.stack.push(Value::Ref(id));
        Ok(())
    }
}

/// Maps a possibly-negative index onto `0..len`.
pub(super) fn resolve_index(len: usize, idx: i64) -> Option<usize> {
    let len_i64 = i64::try_from(len).ok()?;
    let idx = if idx < 0 { idx + len_i64 } else { idx };
    if (0..len_i64).contains(&idx) {
        usize::try_from(idx).ok()
    } else {
        None
    }
}

/// Character at a (possibly negative) index, counting Unicode scalars.
fn char_at(s: &str, idx: i64) -> Option<char> {
    let len = s.chars().count();
    let i = resolve_index(len, idx)?;
    s.chars().nth(i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_index_handles_negatives() {
        assert_eq!(resolve_index(3, 0), Some(0));
        assert_eq!(resolve_index(3, -1), Some(2));
        assert_eq!(resolve_index(3, -3), Some(0));
        assert_eq!(resolve_index(3, 3), None);
        assert_eq!(resolve_index(3, -4), None);
        assert_eq!(resolve_index(0, 0), None);
    }

    #[test]
    fn char_at_counts_scalars() {
        assert_eq!(char_at("héllo", 1), Some('é'));
        assert_eq!(char_at("héllo", -1), Some('o'));
        assert_eq!(char_at("héllo", 5), None);
    }
}
