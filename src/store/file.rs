use crate::store::KvStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

/// Durable store keeping one JSON file per namespace under a root directory.
/// Writes go through a temp file + rename so a crash never leaves a
/// half-written namespace.
pub struct FileKvStore {
    root: PathBuf,
    // Serializes read-modify-write cycles across namespaces.
    lock: Mutex<()>,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create store directory {}", root.display()))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{}.json", safe_filename(namespace)))
    }

    fn load(&self, path: &Path) -> HashMap<String, Value> {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("corrupted store file {} ignored: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    fn save(&self, path: &Path, map: &HashMap<String, Value>) -> Result<()> {
        let raw = serde_json::to_string(map).context("Failed to serialize namespace")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Keep namespace-derived filenames to a conservative character set.
fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        let map = self.load(&self.namespace_path(namespace));
        Ok(map.get(key).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.namespace_path(namespace);
        let mut map = self.load(&path);
        map.insert(key.to_string(), value);
        self.save(&path, &map)
    }

    async fn del(&self, namespace: &str, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.namespace_path(namespace);
        let mut map = self.load(&path);
        if map.remove(key).is_some() {
            self.save(&path, &map)?;
        }
        Ok(())
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let _guard = self.lock.lock().await;
        let map = self.load(&self.namespace_path(namespace));
        Ok(map.keys().cloned().collect())
    }

    async fn clear(&self, namespace: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.namespace_path(namespace);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
