use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Map, Value};

use super::{
    merge_fields, validate_blob_path, validate_id, BlobStore, DocumentStore, TransactFn,
};

/// One pretty-printed JSON file per document:
/// `<root>/<collection>/<id>.json`. Writes and transactions are serialised
/// by a store-wide lock, so atomicity holds within one process.
#[derive(Debug)]
pub struct DirDocumentStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl DirDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf> {
        validate_blob_path(collection)
            .with_context(|| format!("invalid collection '{collection}'"))?;
        Ok(self.root.join(collection))
    }

    fn doc_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.collection_dir(collection)?.join(format!("{id}.json")))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow!("document store lock poisoned"))
    }
}

impl DocumentStore for DirDocumentStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let path = self.doc_path(collection, id)?;
        read_json_value(&path)
    }

    fn set(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        let path = self.doc_path(collection, id)?;
        let _guard = self.guard()?;
        write_json_value(&path, &doc)
    }

    fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()> {
        let path = self.doc_path(collection, id)?;
        let _guard = self.guard()?;
        let Some(mut doc) = read_json_value(&path)? else {
            bail!("document {collection}/{id} not found");
        };
        merge_fields(&mut doc, fields)?;
        write_json_value(&path, &doc)
    }

    fn transact(&self, collection: &str, id: &str, apply: &mut TransactFn<'_>) -> Result<()> {
        let path = self.doc_path(collection, id)?;
        let _guard = self.guard()?;
        let current = read_json_value(&path)?;
        if let Some(next) = apply(current.as_ref())? {
            write_json_value(&path, &next)?;
        }
        Ok(())
    }

    fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let dir = self.collection_dir(collection)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("failed listing {}", dir.display())),
        };
        let mut docs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Some(doc) = read_json_value(&path)? {
                docs.push((id.to_string(), doc));
            }
        }
        docs.sort_by(|left, right| left.0.cmp(&right.0));
        Ok(docs)
    }
}

/// Blob files under a root, with the content type and visibility kept in a
/// `<file>.meta.json` sidecar.
#[derive(Debug)]
pub struct DirBlobStore {
    root: PathBuf,
    public_base_url: String,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: Option<String>) -> Self {
        let root = root.into();
        let public_base_url = public_base_url
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| format!("file://{}", root.display()));
        Self {
            root,
            public_base_url,
        }
    }

    fn blob_path(&self, path: &str) -> Result<PathBuf> {
        validate_blob_path(path)?;
        Ok(self.root.join(path))
    }

    fn meta_path(blob: &Path) -> PathBuf {
        let mut name = blob.as_os_str().to_os_string();
        name.push(".meta.json");
        PathBuf::from(name)
    }
}

impl BlobStore for DirBlobStore {
    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.blob_path(path)?.is_file())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.blob_path(path)?;
        fs::read(&file).with_context(|| format!("failed reading {}", file.display()))
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let file = self.blob_path(path)?;
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&file, bytes).with_context(|| format!("failed writing {}", file.display()))?;
        write_json_value(
            &Self::meta_path(&file),
            &json!({ "contentType": content_type, "public": false }),
        )
    }

    fn make_public(&self, path: &str) -> Result<String> {
        let file = self.blob_path(path)?;
        if !file.is_file() {
            bail!("blob {path} not found");
        }
        let meta_path = Self::meta_path(&file);
        let mut meta = read_json_value(&meta_path)?.unwrap_or_else(|| json!({}));
        let mut fields = Map::new();
        fields.insert("public".to_string(), Value::Bool(true));
        merge_fields(&mut meta, fields)?;
        write_json_value(&meta_path, &meta)?;
        Ok(format!("{}/{}", self.public_base_url, path))
    }
}

fn read_json_value(path: &Path) -> Result<Option<Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed reading {}", path.display())),
    };
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    Ok(Some(parsed))
}

fn write_json_value(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut staging = path.as_os_str().to_os_string();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("failed writing {}", staging.display()))?;
    fs::rename(&staging, path).with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documents_persist_across_instances() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DirDocumentStore::new(temp.path());
        store.set("episodes", "ep-1", json!({"status": "draft"}))?;
        store.set("episodes/ep-1/comments", "c-1", json!({"emoji": "🔥"}))?;

        let reopened = DirDocumentStore::new(temp.path());
        assert_eq!(
            reopened.get("episodes", "ep-1")?,
            Some(json!({"status": "draft"}))
        );
        let listed = reopened.list("episodes")?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, "ep-1");
        assert_eq!(reopened.list("episodes/ep-1/comments")?.len(), 1);
        assert!(reopened.list("characters")?.is_empty());
        Ok(())
    }

    #[test]
    fn transact_writes_only_when_asked() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = DirDocumentStore::new(temp.path());
        store.transact("rateLimits", "k", &mut |_| Ok(None))?;
        assert!(store.get("rateLimits", "k")?.is_none());
        store.transact("rateLimits", "k", &mut |current| {
            let count = current
                .and_then(|doc| doc.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok(Some(json!({ "count": count + 1 })))
        })?;
        store.transact("rateLimits", "k", &mut |current| {
            let count = current
                .and_then(|doc| doc.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok(Some(json!({ "count": count + 1 })))
        })?;
        assert_eq!(store.get("rateLimits", "k")?, Some(json!({"count": 2})));
        Ok(())
    }

    #[test]
    fn blobs_round_trip_with_public_url() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let blobs = DirBlobStore::new(temp.path(), Some("https://cdn.test/".to_string()));
        assert!(!blobs.exists("episodes/ep/panels/0.png")?);
        blobs.put("episodes/ep/panels/0.png", b"png", "image/png")?;
        assert!(blobs.exists("episodes/ep/panels/0.png")?);
        assert_eq!(blobs.get("episodes/ep/panels/0.png")?, b"png".to_vec());
        assert_eq!(
            blobs.make_public("episodes/ep/panels/0.png")?,
            "https://cdn.test/episodes/ep/panels/0.png"
        );
        assert!(blobs.put("../escape.png", b"x", "image/png").is_err());
        Ok(())
    }
}
