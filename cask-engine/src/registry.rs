//! Class constructor registry
//!
//! Class-tagged values are reconstructed through an explicit capability
//! table: the embedding application registers a constructor per type name,
//! and the decoder refuses class tags it has no constructor for. There is
//! one process-wide registry; containers snapshot it when they open so a
//! decode pass sees a consistent table.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;

use crate::value::Record;

/// Constructor invoked when a class-tagged value is decoded. Receives the
/// decoded field data and returns the record to attach to the instance,
/// which lets applications migrate or validate fields on load.
pub type ClassConstructor = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Table mapping class names to constructors.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    constructors: HashMap<String, ClassConstructor>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        TypeRegistry {
            constructors: HashMap::new(),
        }
    }

    /// Register a constructor for `name`, replacing any previous one
    pub fn register(
        &mut self,
        name: impl Into<String>,
        constructor: impl Fn(Record) -> Record + Send + Sync + 'static,
    ) {
        self.constructors
            .insert(name.into(), Arc::new(constructor));
    }

    /// Register the identity constructor for `name`: instances decode with
    /// their stored fields unchanged
    pub fn register_plain(&mut self, name: impl Into<String>) {
        self.register(name, |fields| fields);
    }

    /// Remove the constructor for `name`
    pub fn unregister(&mut self, name: &str) -> bool {
        self.constructors.remove(name).is_some()
    }

    /// Check whether a constructor is registered for `name`
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Run the constructor for `name` over `fields`; `None` if unregistered
    pub fn construct(&self, name: &str, fields: Record) -> Option<Record> {
        self.constructors.get(name).map(|ctor| ctor(fields))
    }
}

lazy_static! {
    static ref GLOBAL_REGISTRY: RwLock<TypeRegistry> = RwLock::new(TypeRegistry::new());
}

/// Register a constructor in the process-wide registry
pub fn register_class(
    name: impl Into<String>,
    constructor: impl Fn(Record) -> Record + Send + Sync + 'static,
) {
    GLOBAL_REGISTRY.write().register(name, constructor);
}

/// Register the identity constructor in the process-wide registry
pub fn register_plain_class(name: impl Into<String>) {
    GLOBAL_REGISTRY.write().register_plain(name);
}

/// Remove a constructor from the process-wide registry
pub fn unregister_class(name: &str) -> bool {
    GLOBAL_REGISTRY.write().unregister(name)
}

/// Snapshot of the process-wide registry. Constructors are shared, so the
/// snapshot is cheap and unaffected by later registrations.
pub fn global_registry() -> TypeRegistry {
    GLOBAL_REGISTRY.read().clone()
}
