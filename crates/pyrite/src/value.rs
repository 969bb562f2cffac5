use std::borrow::Cow;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::{
    exception::{RunError, RunResult},
    heap::{Heap, HeapData, HeapId},
    intern::{FunctionId, Interns, StringId},
};

/// A runtime value.
///
/// Small values are stored inline; strings from the constant pool stay
/// interned, and everything mutable or structured lives in the [`Heap`]
/// behind a [`HeapId`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) enum Value {
    /// Unassigned local, cell, or global slot. Loading one raises NameError,
    /// so scripts never observe this value.
    Undefined,
    None,
    Bool(bool),
    Int(i64),
    /// A string constant from the program's intern table.
    InternString(StringId),
    /// A plain function with no captured variables.
    Function(FunctionId),
    Ref(HeapId),
}

impl Value {
    /// Python-style type name, used in error messages.
    pub(crate) fn type_name(&self, heap: &Heap, interns: &Interns) -> Cow<'static, str> {
        match self {
            Self::Undefined => Cow::Borrowed("undefined"),
            Self::None => Cow::Borrowed("NoneType"),
            Self::Bool(_) => Cow::Borrowed("bool"),
            Self::Int(_) => Cow::Borrowed("int"),
            Self::InternString(_) => Cow::Borrowed("str"),
            Self::Function(_) => Cow::Borrowed("function"),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(_) => Cow::Borrowed("str"),
                HeapData::List(_) => Cow::Borrowed("list"),
                HeapData::Dict(_) => Cow::Borrowed("dict"),
                HeapData::Range { .. } => Cow::Borrowed("range"),
                HeapData::Cell(_) => Cow::Borrowed("cell"),
                HeapData::Closure(_) => Cow::Borrowed("function"),
                HeapData::Class(_) => Cow::Borrowed("type"),
                HeapData::Instance(instance) => match heap.get(instance.class) {
                    HeapData::Class(class) => Cow::Owned(interns.get(class.name).to_owned()),
                    _ => Cow::Borrowed("object"),
                },
                HeapData::Iter(_) => Cow::Borrowed("iterator"),
            },
        }
    }

    /// Truthiness: `0`, `""`, empty containers, and `None` are falsy.
    pub(crate) fn is_truthy(&self, heap: &Heap, interns: &Interns) -> bool {
        match self {
            Self::Undefined | Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::InternString(id) => !interns.get(*id).is_empty(),
            Self::Function(_) => true,
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => !s.is_empty(),
                HeapData::List(items) => !items.is_empty(),
                HeapData::Dict(entries) => !entries.is_empty(),
                HeapData::Range { start, stop, step } => {
                    if *step >= 0 {
                        start < stop
                    } else {
                        start > stop
                    }
                }
                _ => true,
            },
        }
    }

    /// The string content if this value is a string (interned or heap).
    pub(crate) fn as_str<'a>(&self, heap: &'a Heap, interns: &'a Interns) -> Option<&'a str> {
        match self {
            Self::InternString(id) => Some(interns.get(*id)),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether every id embedded in this value is in range for the given
    /// heap, function table, and intern table sizes.
    ///
    /// Used to vet deserialized execution state before it is run.
    pub(crate) fn refs_in_range(&self, heap_len: usize, num_functions: usize, num_interns: usize) -> bool {
        match self {
            Self::Ref(id) => id.index() < heap_len,
            Self::Function(fid) => fid.index() < num_functions,
            Self::InternString(sid) => sid.index() < num_interns,
            _ => true,
        }
    }

    /// Numeric view shared by `int` and `bool`.
    pub(crate) fn as_number(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// `str()` rendering: strings are unquoted, containers render their
    /// elements with `repr`.
    pub(crate) fn py_str(&self, heap: &Heap, interns: &Interns) -> String {
        if let Some(s) = self.as_str(heap, interns) {
            return s.to_owned();
        }
        self.py_repr(heap, interns)
    }

    /// `repr()` rendering: strings are quoted and containers recurse, with
    /// `[...]`/`{...}` placeholders breaking reference cycles.
    pub(crate) fn py_repr(&self, heap: &Heap, interns: &Interns) -> String {
        let mut out = String::new();
        self.write_repr(&mut out, heap, interns, &mut Vec::new());
        out
    }

    fn write_repr(&self, out: &mut String, heap: &Heap, interns: &Interns, seen: &mut Vec<HeapId>) {
        match self {
            Self::Undefined => out.push_str("<undefined>"),
            Self::None => out.push_str("None"),
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::InternString(id) => write_str_repr(out, interns.get(*id)),
            Self::Function(_) => out.push_str("<function>"),
            Self::Ref(id) => self.write_heap_repr(*id, out, heap, interns, seen),
        }
    }

    fn write_heap_repr(&self, id: HeapId, out: &mut String, heap: &Heap, interns: &Interns, seen: &mut Vec<HeapId>) {
        match heap.get(id) {
            HeapData::Str(s) => write_str_repr(out, s),
            HeapData::List(items) => {
                if seen.contains(&id) {
                    out.push_str("[...]");
                    return;
                }
                seen.push(id);
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_repr(out, heap, interns, seen);
                }
                out.push(']');
                seen.pop();
            }
            HeapData::Dict(entries) => {
                if seen.contains(&id) {
                    out.push_str("{...}");
                    return;
                }
                seen.push(id);
                out.push('{');
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    key.write_repr(out);
                    out.push_str(": ");
                    value.write_repr(out, heap, interns, seen);
                }
                out.push('}');
                seen.pop();
            }
            HeapData::Range { start, stop, step } => {
                if *step == 1 {
                    let _ = write!(out, "range({start}, {stop})");
                } else {
                    let _ = write!(out, "range({start}, {stop}, {step})");
                }
            }
            HeapData::Cell(value) => value.write_repr(out, heap, interns, seen),
            HeapData::Closure(_) => out.push_str("<function>"),
            HeapData::Class(class) => {
                let _ = write!(out, "<class '{}'>", interns.get(class.name));
            }
            HeapData::Instance(instance) => {
                let class_name = match heap.get(instance.class) {
                    HeapData::Class(class) => interns.get(class.name),
                    _ => "object",
                };
                let _ = write!(out, "<{class_name} instance>");
            }
            HeapData::Iter(_) => out.push_str("<iterator>"),
        }
    }

    /// Structural equality.
    ///
    /// Ints and bools compare numerically, strings by content, lists and
    /// dicts element-wise; functions, classes, and instances by identity.
    /// Unrelated types compare unequal rather than raising.
    pub(crate) fn py_eq(&self, other: &Self, heap: &Heap, interns: &Interns) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.as_str(heap, interns), other.as_str(heap, interns)) {
            return a == b;
        }
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Function(a), Self::Function(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => {
                if a == b {
                    return true;
                }
                match (heap.get(*a), heap.get(*b)) {
                    (HeapData::List(xs), HeapData::List(ys)) => {
                        xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| x.py_eq(y, heap, interns))
                    }
                    (HeapData::Dict(xs), HeapData::Dict(ys)) => {
                        xs.len() == ys.len()
                            && xs
                                .iter()
                                .all(|(k, v)| ys.get(k).is_some_and(|w| v.py_eq(w, heap, interns)))
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

fn write_str_repr(out: &mut String, s: &str) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
}

/// Hashable dict key. `True` and `1` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum DictKey {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl DictKey {
    pub(crate) fn from_value(value: &Value, heap: &Heap, interns: &Interns) -> RunResult<Self> {
        if let Some(s) = value.as_str(heap, interns) {
            return Ok(Self::Str(s.to_owned()));
        }
        match value {
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Bool(b) => Ok(Self::Bool(*b)),
            _ => Err(RunError::type_error(format!(
                "unhashable type: '{}'",
                value.type_name(heap, interns)
            ))),
        }
    }

    pub(crate) fn into_value(self, heap: &mut Heap) -> Value {
        match self {
            Self::Int(i) => Value::Int(i),
            Self::Bool(b) => Value::Bool(b),
            Self::Str(s) => Value::Ref(heap.allocate_str(s)),
        }
    }

    pub(crate) fn write_repr(&self, out: &mut String) {
        match self {
            Self::Int(i) => {
                let _ = write!(out, "{i}");
            }
            Self::Bool(true) => out.push_str("True"),
            Self::Bool(false) => out.push_str("False"),
            Self::Str(s) => write_str_repr(out, s),
        }
    }

    pub(crate) fn repr(&self) -> String {
        let mut out = String::new();
        self.write_repr(&mut out);
        out
    }
}
