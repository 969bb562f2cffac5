use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Identifier for an interned string.
///
/// Interned strings are created at compile time (names, string literals,
/// method names) and stored once in the program's [`Interns`] table. The VM
/// only ever reads them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    /// Rebuilds an id from a bytecode operand.
    #[must_use]
    pub(crate) fn from_u16(raw: u16) -> Self {
        Self(u32::from(raw))
    }
}

/// Identifier for a compiled function body within a [`Program`](crate::Program).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub(crate) u16);

impl FunctionId {
    #[must_use]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Mutable interner used while compiling.
///
/// Deduplicates strings and hands out stable [`StringId`]s. Converted into a
/// read-only [`Interns`] once compilation finishes.
#[derive(Debug, Default)]
pub(crate) struct InternerBuilder {
    strings: Vec<String>,
    lookup: AHashMap<String, StringId>,
}

impl InternerBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning the existing id if it was seen before.
    pub(crate) fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.lookup.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).unwrap_or(u32::MAX));
        self.strings.push(s.to_owned());
        self.lookup.insert(s.to_owned(), id);
        id
    }

    pub(crate) fn finish(self) -> Interns {
        Interns { strings: self.strings }
    }
}

/// Read-only interned string storage carried by a compiled program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Interns {
    strings: Vec<String>,
}

impl Interns {
    /// Returns the string for an id.
    ///
    /// Ids are only minted by the interner, so a missing entry means the
    /// program and its interns are mismatched; an empty string keeps error
    /// formatting from panicking in that case.
    #[must_use]
    pub(crate) fn get(&self, id: StringId) -> &str {
        self.strings.get(id.index()).map_or("", String::as_str)
    }

    pub(crate) fn count(&self) -> usize {
        self.strings.len()
    }
}
