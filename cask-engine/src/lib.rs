//! Cask Engine - embedded persistent object store
//!
//! This crate provides a single-file object container with one root value,
//! typed ordered secondary indexes, and a self-describing binary value
//! codec (bjson) used for all persistence.

pub mod error;
pub mod value;
pub mod bjson;
pub mod index;
pub mod registry;
pub mod container;

pub use error::{ErrorCode, StorageError, StorageResult};
pub use value::{Array, ClassInstance, Record, Value};
pub use index::{Index, IndexIter, Key, KeyKind};
pub use registry::TypeRegistry;
pub use container::{OpenFlags, Storage};
