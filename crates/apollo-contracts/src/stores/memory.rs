use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};

use super::{
    merge_fields, validate_blob_path, validate_id, BlobStore, DocumentStore, TransactFn,
};

type Collections = BTreeMap<String, BTreeMap<String, Value>>;

/// Mutex-guarded document map. Transactions run under the lock.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<Collections>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, Collections>> {
        self.collections
            .lock()
            .map_err(|_| anyhow!("document store lock poisoned"))
    }
}

impl DocumentStore for MemoryDocumentStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let collections = self.locked()?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn set(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        validate_id(id)?;
        let mut collections = self.locked()?;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let mut collections = self.locked()?;
        let doc = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .with_context(|| format!("document {collection}/{id} not found"))?;
        merge_fields(doc, fields)
    }

    fn transact(&self, collection: &str, id: &str, apply: &mut TransactFn<'_>) -> Result<()> {
        validate_id(id)?;
        let mut collections = self.locked()?;
        let docs = collections.entry(collection.to_string()).or_default();
        if let Some(next) = apply(docs.get(id))? {
            docs.insert(id.to_string(), next);
        }
        Ok(())
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let collections = self.locked()?;
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
struct MemoryBlob {
    bytes: Vec<u8>,
    content_type: String,
    public: bool,
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, MemoryBlob>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        let blobs = self.blobs.lock().ok()?;
        blobs.get(path).map(|blob| blob.content_type.clone())
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(path).map(|blob| blob.public))
            .unwrap_or(false)
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs
            .lock()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn exists(&self, path: &str) -> Result<bool> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        Ok(blobs.contains_key(path))
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        blobs
            .get(path)
            .map(|blob| blob.bytes.clone())
            .with_context(|| format!("blob {path} not found"))
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        validate_blob_path(path)?;
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        blobs.insert(
            path.to_string(),
            MemoryBlob {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                public: false,
            },
        );
        Ok(())
    }

    fn make_public(&self, path: &str) -> Result<String> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| anyhow!("blob store lock poisoned"))?;
        let blob = blobs
            .get_mut(path)
            .with_context(|| format!("blob {path} not found"))?;
        blob.public = true;
        Ok(format!("memory://{path}"))
    }
}
