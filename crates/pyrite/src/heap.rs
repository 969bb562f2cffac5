use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    exception::{RunError, RunResult},
    intern::{FunctionId, StringId},
    value::{DictKey, Value},
};

/// Index handle into the [`Heap`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Insertion-ordered map used for dict entries and instance fields.
pub(crate) type PyDict = IndexMap<DictKey, Value, ahash::RandomState>;

/// A closure: a function body plus the cells it captured from enclosing scopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Closure {
    pub function: FunctionId,
    pub captured: SmallVec<[HeapId; 4]>,
}

/// A class: its name and a name-to-function method table.
///
/// Methods are stored in definition order; magic names like `__init__` sit in
/// the table like any other method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Class {
    pub name: StringId,
    pub methods: IndexMap<StringId, FunctionId, ahash::RandomState>,
}

/// An instance: its class and named fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub fields: IndexMap<StringId, Value, ahash::RandomState>,
}

/// Live iteration state produced by `GetIter` and advanced by `ForIter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Iter {
    /// Iterates a list by index; sees mutations made during the loop.
    List { list: HeapId, index: usize },
    /// Iterates the characters of a heap string; `index` is a byte offset.
    Str { string: HeapId, index: usize },
    /// Iterates the characters of an interned string constant.
    InternStr { string: StringId, index: usize },
    Range { next: i64, stop: i64, step: i64 },
    /// Iterates a snapshot of dict keys taken when iteration began.
    Keys { keys: Vec<DictKey>, index: usize },
}

/// Data stored in the arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum HeapData {
    Str(String),
    List(Vec<Value>),
    Dict(PyDict),
    Range { start: i64, stop: i64, step: i64 },
    /// A mutable slot shared between a closure and its enclosing scope.
    Cell(Value),
    Closure(Closure),
    Class(Class),
    Instance(Instance),
    Iter(Iter),
}

/// Arena of heap-allocated values.
///
/// Handles are plain indices and entries are never freed individually:
/// reference cycles are harmless and the whole arena is dropped when its
/// session is discarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Heap {
    entries: Vec<HeapData>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate(&mut self, data: HeapData) -> HeapId {
        let id = HeapId(u32::try_from(self.entries.len()).unwrap_or(u32::MAX));
        self.entries.push(data);
        id
    }

    pub(crate) fn allocate_str(&mut self, s: String) -> HeapId {
        self.allocate(HeapData::Str(s))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.index()]
    }

    /// Advances the iterator stored at `id`, returning the next value.
    ///
    /// Returns `Ok(None)` when exhausted. String iteration allocates one
    /// single-character string per step; dict-key iteration allocates for
    /// string keys.
    pub(crate) fn iter_next(&mut self, id: HeapId, intern_str: impl Fn(StringId) -> String) -> RunResult<Option<Value>> {
        let HeapData::Iter(iter) = self.get(id) else {
            return Err(RunError::type_error("object is not an iterator"));
        };
        match iter {
            Iter::List { list, index } => {
                let (list, index) = (*list, *index);
                let HeapData::List(items) = self.get(list) else {
                    return Err(RunError::type_error("list iterator target changed type"));
                };
                let Some(value) = items.get(index).cloned() else {
                    return Ok(None);
                };
                self.set_iter(id, Iter::List { list, index: index + 1 });
                Ok(Some(value))
            }
            Iter::Str { string, index } => {
                let (string, index) = (*string, *index);
                let HeapData::Str(s) = self.get(string) else {
                    return Err(RunError::type_error("string iterator target changed type"));
                };
                let Some(c) = s.get(index..).and_then(|rest| rest.chars().next()) else {
                    return Ok(None);
                };
                self.set_iter(
                    id,
                    Iter::Str {
                        string,
                        index: index + c.len_utf8(),
                    },
                );
                let value = Value::Ref(self.allocate_str(c.to_string()));
                Ok(Some(value))
            }
            Iter::InternStr { string, index } => {
                let (string, index) = (*string, *index);
                let s = intern_str(string);
                let Some(c) = s.get(index..).and_then(|rest| rest.chars().next()) else {
                    return Ok(None);
                };
                self.set_iter(
                    id,
                    Iter::InternStr {
                        string,
                        index: index + c.len_utf8(),
                    },
                );
                let value = Value::Ref(self.allocate_str(c.to_string()));
                Ok(Some(value))
            }
            Iter::Range { next, stop, step } => {
                let (next, stop, step) = (*next, *stop, *step);
                let done = if step >= 0 { next >= stop } else { next <= stop };
                if done {
                    return Ok(None);
                }
                self.set_iter(
                    id,
                    Iter::Range {
                        next: next.wrapping_add(step),
                        stop,
                        step,
                    },
                );
                Ok(Some(Value::Int(next)))
            }
            Iter::Keys { keys, index } => {
                let index = *index;
                let Some(key) = keys.get(index).cloned() else {
                    return Ok(None);
                };
                let HeapData::Iter(Iter::Keys { index: stored, .. }) = self.get_mut(id) else {
                    return Err(RunError::type_error("object is not an iterator"));
                };
                *stored = index + 1;
                Ok(Some(key.into_value(self)))
            }
        }
    }

    fn set_iter(&mut self, id: HeapId, iter: Iter) {
        *self.get_mut(id) = HeapData::Iter(iter);
    }

    /// Verifies that every id stored in the arena points at existing data.
    ///
    /// Run on deserialized snapshots before execution, which indexes the
    /// arena without bounds checks.
    pub(crate) fn check_ids(&self, num_functions: usize, num_interns: usize) -> Result<(), &'static str> {
        let len = self.entries.len();
        let id_ok = |id: HeapId| id.index() < len;
        let value_ok = |v: &Value| v.refs_in_range(len, num_functions, num_interns);
        for entry in &self.entries {
            let ok = match entry {
                HeapData::Str(_) | HeapData::Range { .. } => true,
                HeapData::List(items) => items.iter().all(value_ok),
                HeapData::Dict(entries) => entries.values().all(value_ok),
                HeapData::Cell(value) => value_ok(value),
                HeapData::Closure(closure) => {
                    closure.function.index() < num_functions && closure.captured.iter().copied().all(id_ok)
                }
                HeapData::Class(class) => {
                    class.name.index() < num_interns
                        && class
                            .methods
                            .iter()
                            .all(|(name, fid)| name.index() < num_interns && fid.index() < num_functions)
                }
                HeapData::Instance(instance) => {
                    id_ok(instance.class)
                        && instance
                            .fields
                            .iter()
                            .all(|(name, value)| name.index() < num_interns && value_ok(value))
                }
                HeapData::Iter(iter) => match iter {
                    Iter::List { list, .. } => id_ok(*list),
                    Iter::Str { string, .. } => id_ok(*string),
                    Iter::InternStr { string, .. } => string.index() < num_interns,
                    Iter::Range { .. } | Iter::Keys { .. } => true,
                },
            };
            if !ok {
                return Err("heap entry refers to data out of range");
            }
        }
        Ok(())
    }
}
