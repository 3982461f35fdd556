//! Storage container
//!
//! A container owns one root value plus every index reachable from it,
//! backed by a single file. The lifecycle is `open -> mutate -> close`:
//! `open` acquires the session lock and reconstructs the previous
//! generation, mutations are in-memory and immediately visible within the
//! session, and `close` (or an explicit `commit`) serializes the root and
//! all reachable indexes through the bjson codec and atomically replaces
//! the file. Indexes that are not reachable from the root at flush time
//! are not written — persistence is by reachability, not by registration.

pub(crate) mod format;
pub(crate) mod lock;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bjson::{self, CodecError, IndexResolver};
use crate::error::{StorageError, StorageResult};
use crate::index::{Index, IndexState, KeyKind};
use crate::registry;
use crate::value::{self, Value};

use self::format::IndexTable;
use self::lock::SessionLock;

bitflags! {
    /// Options for [`Storage::open_with`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Load an existing container without ever writing it: the file is
        /// not created when absent and mutating operations fail with
        /// `ReadOnly`. The session lock is still taken.
        const READ_ONLY = 0x0001;
    }
}

/// Shared container state. Index handles hold a weak reference to this,
/// so they outlive the container gracefully: once the container closes,
/// every operation through a handle reports `ContainerClosed`.
pub(crate) struct StoreInner {
    pub(crate) path: PathBuf,
    pub(crate) open: bool,
    pub(crate) read_only: bool,
    pub(crate) root: Value,
    pub(crate) indexes: HashMap<u32, IndexState>,
    pub(crate) next_index_id: u32,
    pub(crate) lock: Option<SessionLock>,
}

/// An open storage container.
pub struct Storage {
    shared: Arc<Mutex<StoreInner>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Open the container at `path`, creating an empty one (root = null,
    /// no indexes) if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Storage> {
        Self::open_with(path, OpenFlags::empty())
    }

    /// Open with explicit flags.
    pub fn open_with(path: impl AsRef<Path>, flags: OpenFlags) -> StorageResult<Storage> {
        let path = path.as_ref().to_path_buf();
        let read_only = flags.contains(OpenFlags::READ_ONLY);

        let session_lock = SessionLock::acquire(&path)?;

        let exists = match fs::metadata(&path) {
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        if !exists {
            if read_only {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("container file not found: {}", path.display()),
                )));
            }
            // A zero-length file marks a fresh container until first flush.
            fs::File::create(&path)?;
        }
        let data = if exists { fs::read(&path)? } else { Vec::new() };

        let shared = Arc::new(Mutex::new(StoreInner {
            path: path.clone(),
            open: true,
            read_only,
            root: Value::Null,
            indexes: HashMap::new(),
            next_index_id: 0,
            lock: Some(session_lock),
        }));

        if !data.is_empty() {
            let raw = format::read_container(&data)?;
            let known: HashSet<u32> = raw.indexes.iter().map(|t| t.handle).collect();
            if known.len() != raw.indexes.len() {
                return Err(StorageError::CorruptFile(
                    "duplicate index handle".into(),
                ));
            }

            let type_registry = registry::global_registry();
            let weak = Arc::downgrade(&shared);
            let mut resolver = LoadResolver {
                store: weak,
                known: &known,
            };

            let mut states = HashMap::new();
            for table in raw.indexes {
                let mut state = IndexState::new(table.kind);
                for (key, blob) in table.entries {
                    let entry =
                        bjson::decode_with(&blob, &type_registry, &mut resolver)?;
                    if state.entries.insert(key, entry).is_some() {
                        return Err(StorageError::CorruptFile(
                            "duplicate key in index table".into(),
                        ));
                    }
                }
                states.insert(table.handle, state);
            }
            let root = bjson::decode_with(&raw.root_blob, &type_registry, &mut resolver)?;

            let mut inner = shared.lock();
            inner.next_index_id =
                states.keys().max().map(|max| max + 1).unwrap_or(0);
            inner.indexes = states;
            inner.root = root;
        }

        info!(path = %path.display(), read_only, "container opened");
        Ok(Storage { shared })
    }

    /// Current root value (`null` for a fresh container). The returned
    /// value shares nodes with the stored root, so in-place mutation of
    /// its arrays and records is visible at the next flush.
    pub fn root(&self) -> StorageResult<Value> {
        let inner = self.shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }
        Ok(inner.root.clone())
    }

    /// Replace the root value. Index references inside the new root must
    /// belong to this container.
    pub fn set_root(&self, value: impl Into<Value>) -> StorageResult<()> {
        let value = value.into();
        let weak = Arc::downgrade(&self.shared);
        assert_owned(&value, &weak)?;

        let mut inner = self.shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }
        if inner.read_only {
            return Err(StorageError::ReadOnly);
        }
        inner.root = value;
        Ok(())
    }

    /// Allocate a new empty index owned by this container. The index is
    /// only persisted if it is reachable from the root at flush time.
    pub fn create_index(&self, kind: KeyKind) -> StorageResult<Index> {
        let weak = Arc::downgrade(&self.shared);
        let mut inner = self.shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }
        if inner.read_only {
            return Err(StorageError::ReadOnly);
        }
        let id = inner.next_index_id;
        inner.next_index_id += 1;
        inner.indexes.insert(id, IndexState::new(kind));
        debug!(id, kind = %kind, "index created");
        Ok(Index { store: weak, id })
    }

    /// Durably flush the current state without closing the session.
    pub fn commit(&self) -> StorageResult<()> {
        let weak = Arc::downgrade(&self.shared);
        let mut inner = self.shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }
        if inner.read_only {
            return Err(StorageError::ReadOnly);
        }
        flush_locked(&weak, &mut inner)
    }

    /// Flush and invalidate the container.
    ///
    /// The session lock is released and every handle is invalidated on all
    /// exit paths; on flush failure the file keeps its previous durable
    /// generation.
    pub fn close(&self) -> StorageResult<()> {
        let weak = Arc::downgrade(&self.shared);
        let mut inner = self.shared.lock();
        if !inner.open {
            return Err(StorageError::ContainerClosed);
        }

        let result = if inner.read_only {
            Ok(())
        } else {
            flush_locked(&weak, &mut inner)
        };

        inner.open = false;
        inner.indexes.clear();
        inner.root = Value::Null;
        inner.lock = None;

        match &result {
            Ok(()) => info!(path = %inner.path.display(), "container closed"),
            Err(err) => {
                warn!(path = %inner.path.display(), error = %err,
                    "close failed; previous generation kept")
            }
        }
        result
    }

    /// Path of the backing file.
    pub fn path(&self) -> PathBuf {
        self.shared.lock().path.clone()
    }

    /// Whether the container is still open.
    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let weak = Arc::downgrade(&self.shared);
        let mut inner = self.shared.lock();
        if !inner.open {
            return;
        }
        if !inner.read_only {
            if let Err(err) = flush_locked(&weak, &mut inner) {
                warn!(path = %inner.path.display(), error = %err,
                    "flush on drop failed; previous generation kept");
            }
        }
        inner.open = false;
        inner.indexes.clear();
        inner.root = Value::Null;
        inner.lock = None;
    }
}

/// Reject values referencing indexes of another container.
fn assert_owned(value: &Value, store: &Weak<Mutex<StoreInner>>) -> StorageResult<()> {
    value::walk_indexes(value, &mut |index: &Index| {
        if !Weak::ptr_eq(&index.store, store) {
            return Err(StorageError::ForeignIndexReference);
        }
        Ok(())
    })
}

/// Serialize the root and every reachable index, then atomically replace
/// the file with the new generation.
fn flush_locked(
    weak: &Weak<Mutex<StoreInner>>,
    inner: &mut StoreInner,
) -> StorageResult<()> {
    // Discover reachable indexes: from the root, then transitively through
    // the entries of every discovered index. Discovery order assigns the
    // stable handles for this generation.
    let mut order: Vec<u32> = Vec::new();
    let mut seen: HashSet<u32> = HashSet::new();
    discover(&inner.root, weak, &mut order, &mut seen)?;
    let mut next = 0;
    while next < order.len() {
        let id = order[next];
        next += 1;
        let state = inner.indexes.get(&id).ok_or_else(|| {
            StorageError::CorruptFile("index handle without backing state".into())
        })?;
        for entry in state.entries.values() {
            discover(entry, weak, &mut order, &mut seen)?;
        }
    }

    let handles: HashMap<u32, u32> = order
        .iter()
        .enumerate()
        .map(|(stable, id)| (*id, stable as u32))
        .collect();
    let mut resolver = SaveResolver {
        store: weak.clone(),
        handles: &handles,
    };

    let root_blob = bjson::encode_with(&inner.root, &mut resolver)?;
    let mut tables = Vec::with_capacity(order.len());
    for (stable, id) in order.iter().enumerate() {
        let state = inner.indexes.get(id).ok_or_else(|| {
            StorageError::CorruptFile("index handle without backing state".into())
        })?;
        let mut entries = Vec::with_capacity(state.entries.len());
        for (key, entry) in &state.entries {
            entries.push((key.clone(), bjson::encode_with(entry, &mut resolver)?));
        }
        tables.push(IndexTable {
            handle: stable as u32,
            kind: state.kind,
            entries,
        });
    }

    let pruned = inner.indexes.len() - order.len();
    if pruned > 0 {
        debug!(pruned, "unreachable indexes not persisted");
    }

    format::replace_file(&inner.path, &root_blob, &tables)
}

fn discover(
    value: &Value,
    store: &Weak<Mutex<StoreInner>>,
    order: &mut Vec<u32>,
    seen: &mut HashSet<u32>,
) -> StorageResult<()> {
    value::walk_indexes(value, &mut |index: &Index| {
        if !Weak::ptr_eq(&index.store, store) {
            return Err(StorageError::ForeignIndexReference);
        }
        if seen.insert(index.id) {
            order.push(index.id);
        }
        Ok(())
    })
}

/// Resolver used while loading: stable handles map to pre-created index
/// states; anything else is structural corruption.
struct LoadResolver<'a> {
    store: Weak<Mutex<StoreInner>>,
    known: &'a HashSet<u32>,
}

impl IndexResolver for LoadResolver<'_> {
    fn encode_index(&mut self, _index: &Index) -> Result<u32, CodecError> {
        Err(CodecError::Unencodable(
            "encode during a container load pass".into(),
        ))
    }

    fn decode_index(&mut self, handle: u32) -> Result<Index, CodecError> {
        if !self.known.contains(&handle) {
            return Err(CodecError::Malformed(format!(
                "reference to unknown index handle {}",
                handle
            )));
        }
        Ok(Index {
            store: self.store.clone(),
            id: handle,
        })
    }
}

/// Resolver used while saving: live handles of this container map to the
/// stable handles assigned by the current discovery pass.
struct SaveResolver<'a> {
    store: Weak<Mutex<StoreInner>>,
    handles: &'a HashMap<u32, u32>,
}

impl IndexResolver for SaveResolver<'_> {
    fn encode_index(&mut self, index: &Index) -> Result<u32, CodecError> {
        if !Weak::ptr_eq(&index.store, &self.store) {
            return Err(CodecError::ForeignIndex);
        }
        self.handles
            .get(&index.id)
            .copied()
            .ok_or_else(|| CodecError::Malformed("index missed by discovery".into()))
    }

    fn decode_index(&mut self, _handle: u32) -> Result<Index, CodecError> {
        Err(CodecError::Malformed(
            "decode during a container save pass".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Key;
    use crate::registry::{register_plain_class, unregister_class};
    use crate::value::{Array, ClassInstance, Record};
    use tempfile::tempdir;

    fn entry(key: &str, val: i32) -> Value {
        Value::record(vec![(key, Value::Int(val))])
    }

    #[test]
    fn test_fresh_container_has_null_root() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        assert_eq!(storage.root().unwrap(), Value::Null);
        storage.close().unwrap();
    }

    #[test]
    fn test_reopen_restores_root_and_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            let index = storage.create_index(KeyKind::String).unwrap();
            index.set("a", entry("a", 1)).unwrap();
            index.set("b", entry("b", 2)).unwrap();
            index.set("c", entry("c", 3)).unwrap();

            storage
                .set_root(Value::record(vec![
                    ("tbool", Value::Bool(true)),
                    ("tinteger", Value::Int(42)),
                    ("tlong", Value::bigint(420)),
                    ("tfloat", Value::Float(3.1415926)),
                    ("tstring", Value::String("forty two".into())),
                    (
                        "tarray",
                        Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
                    ),
                    ("tdate", Value::Date(1616889600000)),
                    ("istring", Value::Index(index)),
                ]))
                .unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        let root = match storage.root().unwrap() {
            Value::Record(rec) => rec,
            other => panic!("expected record root, got {:?}", other),
        };
        assert_eq!(root.get("tbool"), Some(Value::Bool(true)));
        assert_eq!(root.get("tinteger"), Some(Value::Int(42)));
        assert_eq!(root.get("tlong"), Some(Value::bigint(420)));
        assert_eq!(root.get("tfloat"), Some(Value::Float(3.1415926)));
        assert_eq!(root.get("tstring"), Some(Value::String("forty two".into())));
        assert_eq!(root.get("tdate"), Some(Value::Date(1616889600000)));
        assert_eq!(
            root.get("tarray"),
            Some(Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );

        let index = match root.get("istring") {
            Some(Value::Index(index)) => index,
            other => panic!("expected index, got {:?}", other),
        };
        assert_eq!(index.key_kind().unwrap(), KeyKind::String);
        assert_eq!(index.len().unwrap(), 3);
        assert_eq!(index.get("a").unwrap(), Some(entry("a", 1)));
        assert_eq!(index.get("b").unwrap(), Some(entry("b", 2)));
        assert_eq!(index.get("c").unwrap(), Some(entry("c", 3)));
        storage.close().unwrap();
    }

    #[test]
    fn test_iteration_and_select() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let index = storage.create_index(KeyKind::String).unwrap();
        // Inserted out of order; iteration is in key order.
        index.set("c", entry("c", 3)).unwrap();
        index.set("a", entry("a", 1)).unwrap();
        index.set("b", entry("b", 2)).unwrap();

        let all: Vec<Value> = index.iter().unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(all, vec![entry("a", 1), entry("b", 2), entry("c", 3)]);

        let range: Vec<Value> = index
            .select(Key::from("b"), Key::from("c"))
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(range, vec![entry("b", 2), entry("c", 3)]);

        let open_end: Vec<Value> = index
            .select(Key::from("b"), None)
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(open_end, vec![entry("b", 2), entry("c", 3)]);

        let open_start: Vec<Value> = index
            .select(None, Key::from("b"))
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(open_start, vec![entry("a", 1), entry("b", 2)]);

        let inverted: Vec<Value> = index
            .select(Key::from("z"), Key::from("a"))
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert!(inverted.is_empty());

        let both_open: Vec<Value> = index
            .select(None, None)
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(both_open, all);

        storage.close().unwrap();
    }

    #[test]
    fn test_iterator_is_restartable() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let index = storage.create_index(KeyKind::Integer).unwrap();
        for i in 0..5 {
            index.set(i, Value::Int(i * 10)).unwrap();
        }

        let mut iter = index.iter().unwrap();
        assert_eq!(iter.next().unwrap().unwrap(), Value::Int(0));
        assert_eq!(iter.next().unwrap().unwrap(), Value::Int(10));
        iter.restart();
        assert_eq!(iter.next().unwrap().unwrap(), Value::Int(0));
        assert_eq!(iter.count(), 4);

        storage.close().unwrap();
    }

    #[test]
    fn test_numeric_orderings() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();

        let longs = storage.create_index(KeyKind::Long).unwrap();
        longs.set(-5i64, Value::Int(-5)).unwrap();
        longs.set(100i64, Value::Int(100)).unwrap();
        longs.set(0i64, Value::Int(0)).unwrap();
        let order: Vec<Value> = longs.iter().unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(order, vec![Value::Int(-5), Value::Int(0), Value::Int(100)]);

        let dates = storage.create_index(KeyKind::Date).unwrap();
        dates.set(Key::Date(2000), Value::Int(2)).unwrap();
        dates.set(Key::Date(1000), Value::Int(1)).unwrap();
        let order: Vec<Value> = dates.iter().unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(order, vec![Value::Int(1), Value::Int(2)]);

        let floats = storage.create_index(KeyKind::Float).unwrap();
        floats.set(2.5, Value::Int(2)).unwrap();
        floats.set(-1.5, Value::Int(-1)).unwrap();
        let order: Vec<Value> = floats.iter().unwrap().map(|v| v.unwrap()).collect();
        assert_eq!(order, vec![Value::Int(-1), Value::Int(2)]);

        storage.close().unwrap();
    }

    #[test]
    fn test_key_type_mismatch_leaves_index_unchanged() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let index = storage.create_index(KeyKind::String).unwrap();
        index.set("a", Value::Int(1)).unwrap();

        let err = index.set(7, Value::Int(7)).unwrap_err();
        match err {
            StorageError::KeyTypeMismatch { expected, actual } => {
                assert_eq!(expected, KeyKind::String);
                assert_eq!(actual, KeyKind::Integer);
            }
            other => panic!("expected KeyTypeMismatch, got {:?}", other),
        }
        assert_eq!(index.len().unwrap(), 1);

        // Lookups are checked the same way.
        assert!(matches!(
            index.get(7).unwrap_err(),
            StorageError::KeyTypeMismatch { .. }
        ));
        storage.close().unwrap();
    }

    #[test]
    fn test_overwrite_is_not_an_error() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let index = storage.create_index(KeyKind::Integer).unwrap();
        index.set(1, Value::Int(10)).unwrap();
        index.set(1, Value::Int(20)).unwrap();
        assert_eq!(index.len().unwrap(), 1);
        assert_eq!(index.get(1).unwrap(), Some(Value::Int(20)));
        storage.close().unwrap();
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let index = storage.create_index(KeyKind::Integer).unwrap();
        for i in 0..3 {
            index.set(i, Value::Int(i)).unwrap();
        }

        assert_eq!(index.remove(1).unwrap(), Some(Value::Int(1)));
        assert_eq!(index.remove(1).unwrap(), None);
        assert_eq!(index.len().unwrap(), 2);

        index.clear().unwrap();
        assert_eq!(index.len().unwrap(), 0);
        assert!(index.iter().unwrap().next().is_none());
        storage.close().unwrap();
    }

    #[test]
    fn test_unreachable_index_is_pruned() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            let kept = storage.create_index(KeyKind::Integer).unwrap();
            kept.set(1, Value::Int(1)).unwrap();
            let orphan = storage.create_index(KeyKind::String).unwrap();
            orphan.set("gone", Value::Int(0)).unwrap();

            storage
                .set_root(Value::record(vec![("kept", Value::Index(kept))]))
                .unwrap();
            storage.close().unwrap();
        }

        // Exactly one index table survives in the file.
        let raw = format::read_container(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.indexes.len(), 1);
        assert_eq!(raw.indexes[0].kind, KeyKind::Integer);
    }

    #[test]
    fn test_reachability_is_transitive_through_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            let outer = storage.create_index(KeyKind::String).unwrap();
            let nested = storage.create_index(KeyKind::Integer).unwrap();
            nested.set(1, Value::Int(11)).unwrap();
            outer
                .set("inner", Value::record(vec![("idx", Value::Index(nested))]))
                .unwrap();
            storage
                .set_root(Value::record(vec![("outer", Value::Index(outer))]))
                .unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        let root = match storage.root().unwrap() {
            Value::Record(rec) => rec,
            other => panic!("expected record root, got {:?}", other),
        };
        let outer = match root.get("outer") {
            Some(Value::Index(index)) => index,
            other => panic!("expected index, got {:?}", other),
        };
        let nested = match outer.get("inner").unwrap() {
            Some(Value::Record(rec)) => match rec.get("idx") {
                Some(Value::Index(index)) => index,
                other => panic!("expected nested index, got {:?}", other),
            },
            other => panic!("expected record entry, got {:?}", other),
        };
        assert_eq!(nested.get(1).unwrap(), Some(Value::Int(11)));
        storage.close().unwrap();
    }

    #[test]
    fn test_shared_index_reference_resolves_to_one_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            let index = storage.create_index(KeyKind::Integer).unwrap();
            index.set(1, Value::Int(1)).unwrap();
            storage
                .set_root(Value::record(vec![
                    ("first", Value::Index(index.clone())),
                    ("second", Value::Index(index)),
                ]))
                .unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        let root = match storage.root().unwrap() {
            Value::Record(rec) => rec,
            other => panic!("expected record root, got {:?}", other),
        };
        let first = match root.get("first") {
            Some(Value::Index(index)) => index,
            other => panic!("expected index, got {:?}", other),
        };
        let second = match root.get("second") {
            Some(Value::Index(index)) => index,
            other => panic!("expected index, got {:?}", other),
        };
        assert_eq!(first, second);

        // Mutation through one handle is visible through the other.
        first.set(2, Value::Int(2)).unwrap();
        assert_eq!(second.len().unwrap(), 2);

        // One physical copy on disk.
        storage.close().unwrap();
        let raw = format::read_container(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw.indexes.len(), 1);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let storage = Storage::open(&path).unwrap();
        let err = Storage::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::Locked));

        storage.close().unwrap();
        let reopened = Storage::open(&path).unwrap();
        reopened.close().unwrap();
    }

    #[test]
    fn test_operations_after_close_fail() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path().join("test.db")).unwrap();
        let index = storage.create_index(KeyKind::Integer).unwrap();
        storage.close().unwrap();

        assert!(matches!(
            storage.root().unwrap_err(),
            StorageError::ContainerClosed
        ));
        assert!(matches!(
            storage.set_root(Value::Null).unwrap_err(),
            StorageError::ContainerClosed
        ));
        assert!(matches!(
            storage.create_index(KeyKind::Integer).unwrap_err(),
            StorageError::ContainerClosed
        ));
        assert!(matches!(
            storage.close().unwrap_err(),
            StorageError::ContainerClosed
        ));
        assert!(matches!(
            index.set(1, Value::Int(1)).unwrap_err(),
            StorageError::ContainerClosed
        ));
        assert!(matches!(
            index.len().unwrap_err(),
            StorageError::ContainerClosed
        ));
    }

    #[test]
    fn test_foreign_index_rejected_on_set_root() {
        let dir = tempdir().unwrap();
        let a = Storage::open(dir.path().join("a.db")).unwrap();
        let b = Storage::open(dir.path().join("b.db")).unwrap();

        let foreign = b.create_index(KeyKind::Integer).unwrap();
        let err = a
            .set_root(Value::record(vec![("idx", Value::Index(foreign))]))
            .unwrap_err();
        assert!(matches!(err, StorageError::ForeignIndexReference));
        assert_eq!(a.root().unwrap(), Value::Null);

        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn test_foreign_index_rejected_on_index_set() {
        let dir = tempdir().unwrap();
        let a = Storage::open(dir.path().join("a.db")).unwrap();
        let b = Storage::open(dir.path().join("b.db")).unwrap();

        let local = a.create_index(KeyKind::Integer).unwrap();
        let foreign = b.create_index(KeyKind::Integer).unwrap();
        let err = local
            .set(1, Value::record(vec![("idx", Value::Index(foreign))]))
            .unwrap_err();
        assert!(matches!(err, StorageError::ForeignIndexReference));
        assert_eq!(local.len().unwrap(), 0);

        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn test_foreign_index_smuggled_after_set_root_fails_at_close() {
        let dir = tempdir().unwrap();
        let a = Storage::open(dir.path().join("a.db")).unwrap();
        let b = Storage::open(dir.path().join("b.db")).unwrap();

        let arr = Array::new();
        a.set_root(Value::Array(arr.clone())).unwrap();
        // Mutating the shared node after set_root bypasses the eager check.
        arr.push(Value::Index(b.create_index(KeyKind::Integer).unwrap()));

        let err = a.close().unwrap_err();
        assert!(matches!(err, StorageError::ForeignIndexReference));
        // Invalidation happened regardless of the failure.
        assert!(!a.is_open());
        b.close().unwrap();
    }

    #[test]
    fn test_cyclic_root_fails_at_close_and_keeps_old_generation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage.set_root(Value::Int(7)).unwrap();
            storage.close().unwrap();
        }

        {
            let storage = Storage::open(&path).unwrap();
            let rec = Record::new();
            rec.insert("x", Value::Record(rec.clone()));
            storage.set_root(Value::Record(rec)).unwrap();

            let err = storage.close().unwrap_err();
            assert!(matches!(err, StorageError::CyclicValue));
        }

        // Lock was released and the previous generation survived.
        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.root().unwrap(), Value::Int(7));
        storage.close().unwrap();
    }

    #[test]
    fn test_commit_is_durable_without_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let storage = Storage::open(&path).unwrap();
        storage.set_root(Value::Int(1)).unwrap();
        storage.commit().unwrap();

        let raw = format::read_container(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(bjson::decode(&raw.root_blob).unwrap(), Value::Int(1));

        // Session stays usable after commit.
        storage.set_root(Value::Int(2)).unwrap();
        storage.close().unwrap();

        let raw = format::read_container(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(bjson::decode(&raw.root_blob).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_read_only_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage.set_root(Value::Int(1)).unwrap();
            storage.close().unwrap();
        }
        let before = fs::read(&path).unwrap();

        {
            let storage = Storage::open_with(&path, OpenFlags::READ_ONLY).unwrap();
            assert_eq!(storage.root().unwrap(), Value::Int(1));
            assert!(matches!(
                storage.set_root(Value::Int(2)).unwrap_err(),
                StorageError::ReadOnly
            ));
            assert!(matches!(
                storage.create_index(KeyKind::Integer).unwrap_err(),
                StorageError::ReadOnly
            ));
            assert!(matches!(
                storage.commit().unwrap_err(),
                StorageError::ReadOnly
            ));
            storage.close().unwrap();
        }

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_read_only_requires_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let err = Storage::open_with(&path, OpenFlags::READ_ONLY).unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        fs::write(&path, b"definitely not a container").unwrap();

        let err = Storage::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::CorruptFile(_)));
    }

    #[test]
    fn test_leftover_tmp_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage.set_root(Value::Int(9)).unwrap();
            storage.close().unwrap();
        }
        // Simulate a crash that left a half-written generation behind.
        fs::write(format::tmp_path(&path), b"partial garbage").unwrap();

        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.root().unwrap(), Value::Int(9));
        storage.close().unwrap();
    }

    #[test]
    fn test_class_instances_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        register_plain_class("PersistedAccount");

        {
            let storage = Storage::open(&path).unwrap();
            let fields = Record::new();
            fields.insert("balance", Value::bigint(0));
            fields.insert("name", Value::String("Foo".into()));
            storage
                .set_root(Value::record(vec![(
                    "inst",
                    Value::Class(ClassInstance::new("PersistedAccount", fields)),
                )]))
                .unwrap();
            storage.close().unwrap();
        }

        {
            let storage = Storage::open(&path).unwrap();
            let root = match storage.root().unwrap() {
                Value::Record(rec) => rec,
                other => panic!("expected record root, got {:?}", other),
            };
            match root.get("inst") {
                Some(Value::Class(inst)) => {
                    assert_eq!(inst.name, "PersistedAccount");
                    assert_eq!(inst.fields.get("name"), Some(Value::String("Foo".into())));
                }
                other => panic!("expected class instance, got {:?}", other),
            }
            storage.close().unwrap();
        }

        // Without the constructor the open fails instead of degrading.
        unregister_class("PersistedAccount");
        let err = Storage::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::UnknownType(_)));
    }

    #[test]
    fn test_drop_flushes_open_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage.set_root(Value::Int(5)).unwrap();
            // Dropped without close.
        }

        let storage = Storage::open(&path).unwrap();
        assert_eq!(storage.root().unwrap(), Value::Int(5));
        storage.close().unwrap();
    }

    #[test]
    fn test_root_shares_nodes_with_stored_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage
                .set_root(Value::record(vec![("n", Value::Int(1))]))
                .unwrap();
            // Mutate through the getter; the change must be flushed.
            match storage.root().unwrap() {
                Value::Record(rec) => rec.insert("n", Value::Int(2)),
                other => panic!("expected record root, got {:?}", other),
            }
            storage.close().unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        match storage.root().unwrap() {
            Value::Record(rec) => assert_eq!(rec.get("n"), Some(Value::Int(2))),
            other => panic!("expected record root, got {:?}", other),
        }
        storage.close().unwrap();
    }
}
