//! The persistent store collaborator.
//!
//! `PersistentStore` is the narrow key-path/JSON interface the platform
//! storage driver is expected to provide (§2.1, out of scope as a concrete
//! implementation beyond this reference one). A path is an ordered sequence
//! of string keys into a JSON document tree; `update` is the only mutating
//! primitive and is atomic per call.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::Result;

/// A mutation applied to the value (if any) currently stored at a path.
/// Returning `None` deletes the entry.
pub type Mutator = Box<dyn FnOnce(Option<Value>) -> Option<Value> + Send>;

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, path: &[&str]) -> Result<Option<Value>>;
    async fn update(&self, path: &[&str], mutator: Mutator) -> Result<()>;
    async fn delete(&self, path: &[&str]) -> Result<()>;
}

/// A JSON-file-backed [`PersistentStore`].
///
/// The whole document is kept in memory and rewritten to disk on every
/// `update`/`delete`, via a write-to-temp-then-rename so a crash mid-write
/// never corrupts the previous, still-valid file. This is adequate for a
/// single embedding process; it is not meant to be shared across processes.
pub struct FileStore {
    path: PathBuf,
    root: Mutex<Value>,
}

impl FileStore {
    /// Open (or create) the JSON document at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let root = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str(&data).unwrap_or_else(|_| Value::Object(Default::default()))
        } else {
            Value::Object(Default::default())
        };
        Ok(Self {
            path,
            root: Mutex::new(root),
        })
    }

    fn navigate<'a>(root: &'a Value, path: &[&str]) -> Option<&'a Value> {
        let mut cur = root;
        for key in path {
            cur = cur.as_object()?.get(*key)?;
        }
        Some(cur)
    }

    fn persist(&self, root: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(root)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get(&self, path: &[&str]) -> Result<Option<Value>> {
        let root = self.root.lock().await;
        Ok(Self::navigate(&root, path).cloned())
    }

    async fn update(&self, path: &[&str], mutator: Mutator) -> Result<()> {
        let mut root = self.root.lock().await;
        let Some((last, parents)) = path.split_last() else {
            return Ok(());
        };

        let mut cur = &mut *root;
        for key in parents {
            let obj = cur.as_object_mut().expect("store root must hold JSON objects");
            cur = obj
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }

        let obj = cur.as_object_mut().expect("store root must hold JSON objects");
        let existing = obj.get(*last).cloned();
        match mutator(existing) {
            Some(value) => {
                obj.insert((*last).to_string(), value);
            }
            None => {
                obj.remove(*last);
            }
        }

        self.persist(&root)
    }

    async fn delete(&self, path: &[&str]) -> Result<()> {
        self.update(path, Box::new(|_| None)).await
    }
}
