use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    intern::{Interns, StringId},
    parse::CodeRange,
    value::Value,
};

/// Maps a bytecode offset to the source range of the instruction at it.
///
/// Entries are recorded in offset order, so span lookup is a binary search
/// for the last entry at or before the failing instruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct LocationEntry {
    offset: u32,
    range: CodeRange,
}

impl LocationEntry {
    pub(crate) fn new(offset: u32, range: CodeRange) -> Self {
        Self { offset, range }
    }
}

/// A compiled instruction sequence with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Code {
    bytecode: Vec<u8>,
    location_table: Vec<LocationEntry>,
    /// Local variable names indexed by slot, for NameError messages.
    local_names: Vec<StringId>,
    num_locals: u16,
    max_stack_depth: u16,
}

impl Code {
    pub(crate) fn new(
        bytecode: Vec<u8>,
        location_table: Vec<LocationEntry>,
        local_names: Vec<StringId>,
        num_locals: u16,
        max_stack_depth: u16,
    ) -> Self {
        Self {
            bytecode,
            location_table,
            local_names,
            num_locals,
            max_stack_depth,
        }
    }

    pub(crate) fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub(crate) fn num_locals(&self) -> u16 {
        self.num_locals
    }

    pub(crate) fn max_stack_depth(&self) -> u16 {
        self.max_stack_depth
    }

    pub(crate) fn local_name(&self, slot: usize) -> Option<StringId> {
        self.local_names.get(slot).copied()
    }

    /// Source range of the instruction starting at `offset`.
    pub(crate) fn span_at(&self, offset: usize) -> Option<CodeRange> {
        let offset = u32::try_from(offset).ok()?;
        let idx = match self.location_table.binary_search_by_key(&offset, |e| e.offset) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(next) => next - 1,
        };
        Some(self.location_table[idx].range)
    }
}

/// A compiled function body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionDef {
    pub name: StringId,
    pub num_params: u8,
    /// Cells this function allocates for its own captured variables.
    pub num_own_cells: u8,
    pub code: Code,
}

const PROGRAM_MAGIC: &[u8; 4] = b"PYRB";
const PROGRAM_VERSION: u8 = 1;

/// Errors from decoding a persisted program or snapshot.
#[derive(Debug)]
pub enum DecodeError {
    /// The payload does not start with the expected magic bytes.
    BadMagic,
    /// The format version is not supported by this build.
    UnsupportedVersion(u8),
    /// The payload failed to deserialize.
    Codec(postcard::Error),
    /// The payload decoded but refers to data outside its own tables.
    Corrupt(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a pyrite binary payload"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            Self::Codec(e) => write!(f, "payload decoding failed: {e}"),
            Self::Corrupt(what) => write!(f, "corrupted payload: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<postcard::Error> for DecodeError {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e)
    }
}

/// Encodes a payload behind a magic + version header.
pub(crate) fn encode_payload<T: Serialize>(magic: &[u8; 4], value: &T) -> Result<Vec<u8>, postcard::Error> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(magic);
    bytes.push(PROGRAM_VERSION);
    postcard::to_extend(value, bytes)
}

/// Validates the header and decodes the payload.
pub(crate) fn decode_payload<T: for<'de> Deserialize<'de>>(magic: &[u8; 4], bytes: &[u8]) -> Result<T, DecodeError> {
    if bytes.len() < 5 || &bytes[..4] != magic {
        return Err(DecodeError::BadMagic);
    }
    let version = bytes[4];
    if version != PROGRAM_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(&bytes[5..])?)
}

/// A complete compiled program: module code, function bodies, and the shared
/// constant pool and name tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub(crate) interns: Interns,
    pub(crate) constants: Vec<Value>,
    /// Global slot names, for NameError messages.
    pub(crate) global_names: Vec<StringId>,
    pub(crate) functions: Vec<FunctionDef>,
    pub(crate) module: Code,
}

impl Program {
    pub(crate) fn constant(&self, index: usize) -> Value {
        self.constants.get(index).copied().unwrap_or(Value::None)
    }

    /// Serializes the program behind a magic/version header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        encode_payload(PROGRAM_MAGIC, self)
    }

    /// Decodes a program persisted by [`Program::to_bytes`].
    ///
    /// Rejects payloads with the wrong magic, an unknown version, or a body
    /// that fails to deserialize.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_payload(PROGRAM_MAGIC, bytes)
    }
}
