//! bjson - self-describing binary value codec
//!
//! Every encoded unit starts with a one-byte tag, so decoding needs no
//! external schema. The codec is a pure transform: it never retains the
//! values it reads or writes, and it knows nothing about containers —
//! index references cross the boundary as stable u32 handles through the
//! [`IndexResolver`] seam, which the container implements during its own
//! save and load passes.
//!
//! Round-trip law: for every acyclic value `v`, `decode(&encode(&v)?)?`
//! is deep-equal to `v`, preserving float bit patterns and exact bigints.
//! Cyclic values are detected eagerly and rejected before any output is
//! produced.

mod reader;
mod writer;

use std::collections::HashSet;

use thiserror::Error;

use crate::index::Index;
use crate::registry::{self, TypeRegistry};
use crate::value::Value;

/// Nesting limit applied while decoding, so malformed input cannot blow
/// the stack.
pub(crate) const MAX_DEPTH: usize = 512;

/// Value tags on the wire. One byte, always the first byte of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Tag {
    Null = 0x00,
    False = 0x01,
    True = 0x02,
    Int32 = 0x03,
    Float64 = 0x04,
    BigInt = 0x05,
    String = 0x06,
    Date = 0x07,
    Bytes = 0x08,
    Array = 0x09,
    Record = 0x0A,
    Class = 0x0B,
    IndexRef = 0x0C,
}

impl Tag {
    pub(crate) fn from_raw(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Tag::Null),
            0x01 => Some(Tag::False),
            0x02 => Some(Tag::True),
            0x03 => Some(Tag::Int32),
            0x04 => Some(Tag::Float64),
            0x05 => Some(Tag::BigInt),
            0x06 => Some(Tag::String),
            0x07 => Some(Tag::Date),
            0x08 => Some(Tag::Bytes),
            0x09 => Some(Tag::Array),
            0x0A => Some(Tag::Record),
            0x0B => Some(Tag::Class),
            0x0C => Some(Tag::IndexRef),
            _ => None,
        }
    }
}

/// Codec-level errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("value graph contains a cycle")]
    Cyclic,

    #[error("value cannot be encoded: {0}")]
    Unencodable(String),

    #[error("no constructor registered for class '{0}'")]
    UnknownType(String),

    #[error("index reference belongs to a different container")]
    ForeignIndex,

    #[error("value data is truncated")]
    Truncated,

    #[error("malformed value data: {0}")]
    Malformed(String),
}

/// Seam between the codec and whatever owns index handles.
///
/// A container saving itself maps live handles to the stable u32 handles
/// of the current save pass and back; the standalone entry points install
/// [`NoIndexes`], which refuses both directions.
pub trait IndexResolver {
    /// Translate a live index handle into a stable u32 handle
    fn encode_index(&mut self, index: &Index) -> Result<u32, CodecError>;
    /// Translate a stable u32 handle back into a live index handle
    fn decode_index(&mut self, handle: u32) -> Result<Index, CodecError>;
}

/// Resolver for contexts with no container: any index reference is an
/// error in both directions.
pub struct NoIndexes;

impl IndexResolver for NoIndexes {
    fn encode_index(&mut self, _index: &Index) -> Result<u32, CodecError> {
        Err(CodecError::Unencodable(
            "index reference outside a container save pass".into(),
        ))
    }

    fn decode_index(&mut self, handle: u32) -> Result<Index, CodecError> {
        Err(CodecError::Malformed(format!(
            "index handle {} outside a container load pass",
            handle
        )))
    }
}

/// Encode a value to bytes. Index references are not accepted here; use a
/// container save pass for values that reference indexes.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    encode_with(value, &mut NoIndexes)
}

/// Encode a value to bytes, translating index references through `resolver`.
///
/// The value graph is checked for cycles before a single byte is written.
pub fn encode_with(
    value: &Value,
    resolver: &mut dyn IndexResolver,
) -> Result<Vec<u8>, CodecError> {
    ensure_acyclic(value)?;
    writer::write_value(value, resolver)
}

/// Decode one value from the whole buffer, using the process-wide class
/// registry. Trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Value, CodecError> {
    decode_with(buf, &registry::global_registry(), &mut NoIndexes)
}

/// Decode one value from `buf[offset..offset + len]`.
pub fn decode_range(buf: &[u8], offset: usize, len: usize) -> Result<Value, CodecError> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| CodecError::Malformed("decode range outside buffer".into()))?;
    decode(&buf[offset..end])
}

/// Decode one value with an explicit registry and index resolver.
pub fn decode_with(
    buf: &[u8],
    registry: &TypeRegistry,
    resolver: &mut dyn IndexResolver,
) -> Result<Value, CodecError> {
    let mut reader = reader::Reader::new(buf, registry, resolver);
    let value = reader.read_value()?;
    if reader.remaining() != 0 {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes after value",
            reader.remaining()
        )));
    }
    Ok(value)
}

/// Reject values that transitively contain themselves.
///
/// Walks the node graph tracking the current path; shared nodes that are
/// reached twice along different paths are fine and are verified once.
fn ensure_acyclic(value: &Value) -> Result<(), CodecError> {
    let mut path = HashSet::new();
    let mut verified = HashSet::new();
    check_acyclic(value, &mut path, &mut verified)
}

fn check_acyclic(
    value: &Value,
    path: &mut HashSet<usize>,
    verified: &mut HashSet<usize>,
) -> Result<(), CodecError> {
    let (id, children) = match value {
        Value::Array(arr) => (arr.node_id(), arr.items()),
        Value::Record(rec) => (
            rec.node_id(),
            rec.entries().into_iter().map(|(_, v)| v).collect(),
        ),
        Value::Class(inst) => (
            inst.fields.node_id(),
            inst.fields.entries().into_iter().map(|(_, v)| v).collect(),
        ),
        _ => return Ok(()),
    };

    if verified.contains(&id) {
        return Ok(());
    }
    if !path.insert(id) {
        return Err(CodecError::Cyclic);
    }
    for child in &children {
        check_acyclic(child, path, verified)?;
    }
    path.remove(&id);
    verified.insert(id);
    Ok(())
}
