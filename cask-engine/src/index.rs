//! Typed ordered indexes
//!
//! An index maps keys of a single fixed kind to arbitrary values, ordered
//! by the kind's natural total order. Point lookup, insertion and range
//! selection all run in O(log n) against a balanced ordered map; iteration
//! streams entries lazily in ascending key order.
//!
//! An [`Index`] value is a handle: the entry data lives inside the owning
//! container and becomes unreachable when the container is closed. Handles
//! stay cheap to clone and compare, and every operation on a handle whose
//! container has been closed fails with `ContainerClosed`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Weak;

use parking_lot::Mutex;

use crate::container::StoreInner;
use crate::error::{StorageError, StorageResult};
use crate::value::{self, Value};

/// Key kinds supported by indexes. Fixed at index creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// 32-bit signed integer keys
    Integer = 0,
    /// 64-bit signed integer keys
    Long = 1,
    /// IEEE-754 double keys, ordered by total order
    Float = 2,
    /// Millisecond timestamp keys
    Date = 3,
    /// UTF-8 string keys, byte-lexicographic order
    String = 4,
}

impl KeyKind {
    /// Parse a kind from its on-disk tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(KeyKind::Integer),
            1 => Some(KeyKind::Long),
            2 => Some(KeyKind::Float),
            3 => Some(KeyKind::Date),
            4 => Some(KeyKind::String),
            _ => None,
        }
    }

    /// On-disk tag for this kind
    pub fn as_tag(&self) -> u8 {
        *self as u8
    }

    /// Kind name as used by embedders ("integer", "long", ...)
    pub fn name(&self) -> &'static str {
        match self {
            KeyKind::Integer => "integer",
            KeyKind::Long => "long",
            KeyKind::Float => "float",
            KeyKind::Date => "date",
            KeyKind::String => "string",
        }
    }

    /// Parse a kind from its name
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "integer" => Some(KeyKind::Integer),
            "long" => Some(KeyKind::Long),
            "float" => Some(KeyKind::Float),
            "date" => Some(KeyKind::Date),
            "string" => Some(KeyKind::String),
            _ => None,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An index key as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// Key for an integer-kind index
    Integer(i32),
    /// Key for a long-kind index
    Long(i64),
    /// Key for a float-kind index
    Float(f64),
    /// Key for a date-kind index (milliseconds since epoch)
    Date(i64),
    /// Key for a string-kind index
    String(String),
}

impl Key {
    /// The kind this key belongs to
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Integer(_) => KeyKind::Integer,
            Key::Long(_) => KeyKind::Long,
            Key::Float(_) => KeyKind::Float,
            Key::Date(_) => KeyKind::Date,
            Key::String(_) => KeyKind::String,
        }
    }

    pub(crate) fn into_ordered(self) -> IndexKey {
        match self {
            Key::Integer(v) => IndexKey::Integer(v),
            Key::Long(v) => IndexKey::Long(v),
            Key::Float(v) => IndexKey::Float(FloatOrd(v)),
            Key::Date(v) => IndexKey::Date(v),
            Key::String(v) => IndexKey::String(v),
        }
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::Integer(v)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Long(v)
    }
}

impl From<f64> for Key {
    fn from(v: f64) -> Self {
        Key::Float(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::String(v.to_string())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::String(v)
    }
}

/// f64 wrapper ordered by IEEE-754 total order, so float keys form a
/// strict total order (`-0 < +0`, NaN sorts above infinities).
#[derive(Debug, Clone, Copy)]
pub(crate) struct FloatOrd(pub(crate) f64);

impl PartialEq for FloatOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for FloatOrd {}

impl PartialOrd for FloatOrd {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatOrd {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Internal, totally-ordered key representation. One variant per kind;
/// a single index only ever stores keys of one variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum IndexKey {
    Integer(i32),
    Long(i64),
    Float(FloatOrd),
    Date(i64),
    String(String),
}

/// Entry storage for one index, owned by the container.
#[derive(Debug)]
pub(crate) struct IndexState {
    pub(crate) kind: KeyKind,
    pub(crate) entries: BTreeMap<IndexKey, Value>,
}

impl IndexState {
    pub(crate) fn new(kind: KeyKind) -> Self {
        IndexState {
            kind,
            entries: BTreeMap::new(),
        }
    }
}

/// Handle to an index owned by an open container.
#[derive(Clone)]
pub struct Index {
    pub(crate) store: Weak<Mutex<StoreInner>>,
    pub(crate) id: u32,
}

impl Index {
    /// Run `f` against the owning container, failing with `ContainerClosed`
    /// once the container has been closed or dropped.
    fn with_store<R>(
        &self,
        f: impl FnOnce(&mut StoreInner) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let shared = self
            .store
            .upgrade()
            .ok_or(StorageError::ContainerClosed)?;
        let mut inner = shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }
        f(&mut inner)
    }

    fn checked_key(&self, inner: &StoreInner, key: Key) -> StorageResult<IndexKey> {
        let state = inner
            .indexes
            .get(&self.id)
            .ok_or(StorageError::ContainerClosed)?;
        if key.kind() != state.kind {
            return Err(StorageError::KeyTypeMismatch {
                expected: state.kind,
                actual: key.kind(),
            });
        }
        Ok(key.into_ordered())
    }

    /// Insert or overwrite the entry for `key`.
    ///
    /// The key must match the index key kind; the stored value may not
    /// reference indexes of other containers.
    pub fn set(&self, key: impl Into<Key>, value: impl Into<Value>) -> StorageResult<()> {
        let key = key.into();
        let value = value.into();

        // Reject foreign index references before touching the index.
        value::walk_indexes(&value, &mut |index: &Index| {
            if !Weak::ptr_eq(&index.store, &self.store) {
                return Err(StorageError::ForeignIndexReference);
            }
            Ok(())
        })?;

        self.with_store(|inner| {
            if inner.read_only {
                return Err(StorageError::ReadOnly);
            }
            let ordered = self.checked_key(inner, key)?;
            let state = inner
                .indexes
                .get_mut(&self.id)
                .ok_or(StorageError::ContainerClosed)?;
            state.entries.insert(ordered, value);
            Ok(())
        })
    }

    /// Point lookup by key.
    pub fn get(&self, key: impl Into<Key>) -> StorageResult<Option<Value>> {
        let key = key.into();
        self.with_store(|inner| {
            let ordered = self.checked_key(inner, key)?;
            let state = inner
                .indexes
                .get(&self.id)
                .ok_or(StorageError::ContainerClosed)?;
            Ok(state.entries.get(&ordered).cloned())
        })
    }

    /// Remove the entry for `key`, returning its value if present.
    pub fn remove(&self, key: impl Into<Key>) -> StorageResult<Option<Value>> {
        let key = key.into();
        self.with_store(|inner| {
            if inner.read_only {
                return Err(StorageError::ReadOnly);
            }
            let ordered = self.checked_key(inner, key)?;
            let state = inner
                .indexes
                .get_mut(&self.id)
                .ok_or(StorageError::ContainerClosed)?;
            Ok(state.entries.remove(&ordered))
        })
    }

    /// Remove every entry.
    pub fn clear(&self) -> StorageResult<()> {
        self.with_store(|inner| {
            if inner.read_only {
                return Err(StorageError::ReadOnly);
            }
            let state = inner
                .indexes
                .get_mut(&self.id)
                .ok_or(StorageError::ContainerClosed)?;
            state.entries.clear();
            Ok(())
        })
    }

    /// Current entry count.
    pub fn len(&self) -> StorageResult<usize> {
        self.with_store(|inner| {
            let state = inner
                .indexes
                .get(&self.id)
                .ok_or(StorageError::ContainerClosed)?;
            Ok(state.entries.len())
        })
    }

    /// Check if the index has no entries.
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// The key kind fixed at creation.
    pub fn key_kind(&self) -> StorageResult<KeyKind> {
        self.with_store(|inner| {
            let state = inner
                .indexes
                .get(&self.id)
                .ok_or(StorageError::ContainerClosed)?;
            Ok(state.kind)
        })
    }

    /// Iterate all values in ascending key order.
    pub fn iter(&self) -> StorageResult<IndexIter> {
        self.select_opt(None, None)
    }

    /// Iterate values whose keys lie in `[low, high]`, either bound open.
    ///
    /// `low > high` produces an empty sequence, not an error.
    pub fn select(
        &self,
        low: impl Into<Option<Key>>,
        high: impl Into<Option<Key>>,
    ) -> StorageResult<IndexIter> {
        self.select_opt(low.into(), high.into())
    }

    fn select_opt(&self, low: Option<Key>, high: Option<Key>) -> StorageResult<IndexIter> {
        self.with_store(|inner| {
            let lower = match low {
                Some(key) => Some(self.checked_key(inner, key)?),
                None => None,
            };
            let upper = match high {
                Some(key) => Some(self.checked_key(inner, key)?),
                None => None,
            };
            let empty = match (&lower, &upper) {
                (Some(lo), Some(hi)) => lo > hi,
                _ => false,
            };
            Ok(IndexIter {
                index: self.clone(),
                lower,
                upper,
                last: None,
                empty,
                done: empty,
            })
        })
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.store, &other.store)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index").field("id", &self.id).finish()
    }
}

/// Lazy cursor over an index range.
///
/// The cursor does not hold the container lock between steps: each `next`
/// re-seeks from the last yielded key, so entries inserted or removed
/// mid-iteration are observed consistently. `restart` rewinds to the
/// beginning of the range.
pub struct IndexIter {
    index: Index,
    lower: Option<IndexKey>,
    upper: Option<IndexKey>,
    last: Option<IndexKey>,
    empty: bool,
    done: bool,
}

impl IndexIter {
    /// Rewind to the start of the range.
    pub fn restart(&mut self) {
        self.last = None;
        self.done = self.empty;
    }

    fn step(&mut self) -> StorageResult<Option<Value>> {
        let shared = self
            .index
            .store
            .upgrade()
            .ok_or(StorageError::ContainerClosed)?;
        let inner = shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }
        let state = inner
            .indexes
            .get(&self.index.id)
            .ok_or(StorageError::ContainerClosed)?;

        let start = match &self.last {
            Some(key) => Bound::Excluded(key),
            None => match &self.lower {
                Some(key) => Bound::Included(key),
                None => Bound::Unbounded,
            },
        };
        let end = match &self.upper {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };

        match state.entries.range((start, end)).next() {
            Some((key, value)) => {
                let key = key.clone();
                let value = value.clone();
                drop(inner);
                self.last = Some(key);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Iterator for IndexIter {
    type Item = StorageResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(value)) => Some(Ok(value)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
