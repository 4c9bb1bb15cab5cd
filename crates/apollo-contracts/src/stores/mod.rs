//! Boundaries to the managed document database and blob store.
//!
//! Handlers only see these traits; production wiring and tests pick an
//! implementation and inject it.

mod dir;
mod memory;

use anyhow::{bail, Result};
use serde_json::{Map, Value};

pub use dir::{DirBlobStore, DirDocumentStore};
pub use memory::{MemoryBlobStore, MemoryDocumentStore};

/// Transaction body: receives the current document (if any) and returns the
/// document to write, or `None` to leave the record untouched.
pub type TransactFn<'a> = dyn FnMut(Option<&Value>) -> Result<Option<Value>> + 'a;

pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    fn set(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    /// Merges top-level `fields` into an existing document.
    fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Atomic read-modify-write of one document. The body must not call back
    /// into the store.
    fn transact(&self, collection: &str, id: &str, apply: &mut TransactFn<'_>) -> Result<()>;

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}

pub trait BlobStore: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool>;

    fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Writes `bytes` at `path`, replacing any previous object.
    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    fn make_public(&self, path: &str) -> Result<String>;
}

fn merge_fields(doc: &mut Value, fields: Map<String, Value>) -> Result<()> {
    let Some(object) = doc.as_object_mut() else {
        bail!("document is not a JSON object");
    };
    for (key, value) in fields {
        object.insert(key, value);
    }
    Ok(())
}

fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains('/') || id.contains('\\') || id == "." || id == ".." {
        bail!("invalid document id '{id}'");
    }
    Ok(())
}

fn validate_blob_path(path: &str) -> Result<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|segment| segment.is_empty() || segment == "..")
    {
        bail!("invalid blob path '{path}'");
    }
    Ok(())
}
