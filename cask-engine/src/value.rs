//! Dynamically-typed value model
//!
//! A [`Value`] is a closed tagged union over every persistable kind: scalar
//! primitives, arbitrary-precision integers, dates, byte strings, shared
//! array/record nodes, class-tagged records and live index references.
//!
//! Array and record nodes are shared: cloning a `Value` clones the handle,
//! not the contents, so the same node may be reachable from several places
//! in a graph. A graph that reaches one of its own nodes again is cyclic
//! and is rejected by the codec at encode time, never silently truncated.
//!
//! Equality is deep equality. Floats compare by IEEE-754 bit pattern, so
//! `0.0` and `-0.0` differ and `NaN` equals an identical `NaN` — the codec
//! round-trip law is stated in terms of this relation.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use num_bigint::BigInt;
use parking_lot::RwLock;

use crate::index::Index;

/// Render depth cap for Display, so a cyclic graph cannot hang formatting.
const MAX_RENDER_DEPTH: usize = 32;

/// A shared, ordered sequence of values.
#[derive(Clone, Default)]
pub struct Array(Arc<RwLock<Vec<Value>>>);

impl Array {
    /// Create a new empty array node
    pub fn new() -> Self {
        Array(Arc::new(RwLock::new(Vec::new())))
    }

    /// Create an array node from existing elements
    pub fn from_vec(items: Vec<Value>) -> Self {
        Array(Arc::new(RwLock::new(items)))
    }

    /// Append a value
    pub fn push(&self, value: Value) {
        self.0.write().push(value);
    }

    /// Get the element at `idx` (cloned handle, shared contents)
    pub fn get(&self, idx: usize) -> Option<Value> {
        self.0.read().get(idx).cloned()
    }

    /// Replace the element at `idx`; returns false if out of range
    pub fn set(&self, idx: usize, value: Value) -> bool {
        let mut items = self.0.write();
        match items.get_mut(idx) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Check if the array is empty
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Snapshot of the current elements
    pub fn items(&self) -> Vec<Value> {
        self.0.read().clone()
    }

    /// Stable identity of the underlying node, used for cycle detection
    pub(crate) fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let a = self.0.read();
        let b = other.0.read();
        *a == *b
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Array").field(&self.len()).finish()
    }
}

/// A shared record node: string keys mapped to values, insertion order
/// preserved. Overwriting an existing key keeps its original position.
#[derive(Clone, Default)]
pub struct Record(Arc<RwLock<Vec<(String, Value)>>>);

impl Record {
    /// Create a new empty record node
    pub fn new() -> Self {
        Record(Arc::new(RwLock::new(Vec::new())))
    }

    /// Create a record node from key/value pairs, later duplicates winning
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        let record = Record::new();
        for (key, value) in pairs {
            record.insert(key, value);
        }
        record
    }

    /// Insert or overwrite a field
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        let mut fields = self.0.write();
        match fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => fields.push((key, value)),
        }
    }

    /// Look up a field by name
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0
            .read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Remove a field, returning its previous value
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut fields = self.0.write();
        let pos = fields.iter().position(|(k, _)| k == key)?;
        Some(fields.remove(pos).1)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Check if the record has no fields
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Snapshot of the fields in insertion order
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0.read().clone()
    }

    /// Field names in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.0.read().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Stable identity of the underlying node, used for cycle detection
    pub(crate) fn node_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let a = self.0.read();
        let b = other.0.read();
        if a.len() != b.len() {
            return false;
        }
        // Key sets must match; insertion order is preserved for iteration
        // but does not participate in equality.
        a.iter().all(|(key, value)| {
            b.iter().any(|(k, v)| k == key && v == value)
        })
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Record").field(&self.keys()).finish()
    }
}

/// A record tagged with a registered class name. Decoding an instance
/// requires a constructor for `name` in the consuming process.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassInstance {
    /// Registered type name
    pub name: String,
    /// Field data
    pub fields: Record,
}

impl ClassInstance {
    /// Create a new instance of a named class
    pub fn new(name: impl Into<String>, fields: Record) -> Self {
        ClassInstance {
            name: name.into(),
            fields,
        }
    }
}

/// A persistable value.
#[derive(Clone, Debug)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit signed integer
    Int(i32),
    /// IEEE-754 double; round-trips preserve the exact bit pattern
    Float(f64),
    /// Arbitrary-precision signed integer, boxed to keep the enum small
    BigInt(Box<BigInt>),
    /// UTF-8 string
    String(String),
    /// Milliseconds since the Unix epoch, tagged distinctly from Float
    Date(i64),
    /// Opaque byte string
    Bytes(Vec<u8>),
    /// Shared array node
    Array(Array),
    /// Shared record node
    Record(Record),
    /// Class-tagged record
    Class(ClassInstance),
    /// Reference to an index of the owning container
    Index(Index),
}

impl Value {
    /// Short kind name used in error messages and by tools
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
            Value::Class(_) => "class",
            Value::Index(_) => "index",
        }
    }

    /// Build an array value from elements
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Array::from_vec(items))
    }

    /// Build a record value from key/value pairs
    pub fn record(pairs: Vec<(&str, Value)>) -> Value {
        Value::Record(Record::from_pairs(
            pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        ))
    }

    /// Build a byte-string value
    pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(data.into())
    }

    /// Build a bigint value
    pub fn bigint(value: impl Into<BigInt>) -> Value {
        Value::BigInt(Box::new(value.into()))
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > MAX_RENDER_DEPTH {
            return write!(f, "…");
        }
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if *x == 0.0 && x.is_sign_negative() {
                    write!(f, "-0")
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::BigInt(big) => write!(f, "{}n", big),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Date(ms) => write!(f, "date({})", ms),
            Value::Bytes(data) => write!(f, "bytes[{}]", data.len()),
            Value::Array(arr) => {
                write!(f, "[")?;
                for (i, item) in arr.items().iter().enumerate() {
                    if i != 0 {
                        write!(f, ",")?;
                    }
                    item.render(f, depth + 1)?;
                }
                write!(f, "]")
            }
            Value::Record(rec) => {
                write!(f, "{{")?;
                for (i, (key, value)) in rec.entries().iter().enumerate() {
                    if i != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:", key)?;
                    value.render(f, depth + 1)?;
                }
                write!(f, "}}")
            }
            Value::Class(inst) => {
                write!(f, "{}{{", inst.name)?;
                for (i, (key, value)) in inst.fields.entries().iter().enumerate() {
                    if i != 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:", key)?;
                    value.render(f, depth + 1)?;
                }
                write!(f, "}}")
            }
            Value::Index(_) => write!(f, "<index>"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Index(a), Value::Index(b)) => a == b,
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::BigInt(Box::new(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Array> for Value {
    fn from(v: Array) -> Self {
        Value::Array(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(v)
    }
}

impl From<ClassInstance> for Value {
    fn from(v: ClassInstance) -> Self {
        Value::Class(v)
    }
}

impl From<Index> for Value {
    fn from(v: Index) -> Self {
        Value::Index(v)
    }
}

/// Visit every index reference reachable from `value`.
///
/// Shared nodes are visited once; the walk terminates on cyclic graphs, so
/// it is safe to run before the codec's own cycle check.
pub(crate) fn walk_indexes<E>(
    value: &Value,
    visit: &mut impl FnMut(&Index) -> Result<(), E>,
) -> Result<(), E> {
    let mut seen = HashSet::new();
    walk_indexes_inner(value, visit, &mut seen)
}

fn walk_indexes_inner<E>(
    value: &Value,
    visit: &mut impl FnMut(&Index) -> Result<(), E>,
    seen: &mut HashSet<usize>,
) -> Result<(), E> {
    match value {
        Value::Array(arr) => {
            if !seen.insert(arr.node_id()) {
                return Ok(());
            }
            for item in arr.items() {
                walk_indexes_inner(&item, visit, seen)?;
            }
        }
        Value::Record(rec) => {
            if !seen.insert(rec.node_id()) {
                return Ok(());
            }
            for (_, field) in rec.entries() {
                walk_indexes_inner(&field, visit, seen)?;
            }
        }
        Value::Class(inst) => {
            if !seen.insert(inst.fields.node_id()) {
                return Ok(());
            }
            for (_, field) in inst.fields.entries() {
                walk_indexes_inner(&field, visit, seen)?;
            }
        }
        Value::Index(index) => visit(index)?,
        _ => {}
    }
    Ok(())
}
