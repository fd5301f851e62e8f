//! Function metadata store.
//!
//! Records are kept in memory and, when a path is configured, written back
//! to a JSON file after every change so registrations survive a restart.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::function::{FunctionDescriptor, FunctionId, FunctionMetadata};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreContents {
    /// Last id handed out. Ids are never reused, even after a delete.
    last_id: FunctionId,
    functions: BTreeMap<FunctionId, FunctionDescriptor>,
}

pub struct FunctionStore {
    path: Option<PathBuf>,
    state: Mutex<StoreContents>,
}

impl FunctionStore {
    /// A store that forgets everything on restart.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreContents::default()),
        }
    }

    /// Open the store backed by `path`, loading it if it exists. An
    /// unreadable file is logged and replaced on the next write.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            match Self::load_from_file(&path).await {
                Ok(contents) => {
                    info!(
                        path = %path.display(),
                        functions = contents.functions.len(),
                        "Loaded function store"
                    );
                    contents
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = ?e,
                        "Failed to load function store, starting empty"
                    );
                    StoreContents::default()
                }
            }
        } else {
            info!(path = %path.display(), "Function store does not exist, starting empty");
            StoreContents::default()
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    async fn load_from_file(path: &Path) -> Result<StoreContents> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read function store")?;
        let mut state: StoreContents =
            serde_json::from_str(&contents).context("Failed to parse function store")?;
        if let Some(max_id) = state.functions.keys().next_back() {
            state.last_id = state.last_id.max(*max_id);
        }
        Ok(state)
    }

    async fn save(&self, state: &StoreContents) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() &&
            !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let contents =
            serde_json::to_string_pretty(state).context("Failed to serialize function store")?;
        // Write then rename so a crash never leaves a truncated file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .context("Failed to write function store")?;
        tokio::fs::rename(&tmp, path)
            .await
            .context("Failed to replace function store")?;
        Ok(())
    }

    /// Register a function under the next free id.
    pub async fn create(&self, metadata: FunctionMetadata) -> Result<FunctionDescriptor> {
        metadata.validate()?;
        let mut state = self.state.lock().await;
        let id = state.last_id + 1;
        let descriptor = metadata.into_descriptor(id);

        let mut next = state.clone();
        next.last_id = id;
        next.functions.insert(id, descriptor.clone());
        self.save(&next).await?;
        *state = next;

        info!(function_id = id, name = %descriptor.name, "Function created");
        Ok(descriptor)
    }

    pub async fn list(&self) -> Vec<FunctionDescriptor> {
        self.state.lock().await.functions.values().cloned().collect()
    }

    pub async fn get(&self, id: FunctionId) -> Option<FunctionDescriptor> {
        self.state.lock().await.functions.get(&id).cloned()
    }

    /// Replace the metadata of `id`. Returns `None` if no such function.
    pub async fn update(
        &self,
        id: FunctionId,
        metadata: FunctionMetadata,
    ) -> Result<Option<FunctionDescriptor>> {
        metadata.validate()?;
        let mut state = self.state.lock().await;
        if !state.functions.contains_key(&id) {
            return Ok(None);
        }
        let descriptor = metadata.into_descriptor(id);

        let mut next = state.clone();
        next.functions.insert(id, descriptor.clone());
        self.save(&next).await?;
        *state = next;

        info!(function_id = id, "Function updated");
        Ok(Some(descriptor))
    }

    /// Remove `id`. Returns whether it existed.
    pub async fn delete(&self, id: FunctionId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.functions.contains_key(&id) {
            return Ok(false);
        }

        let mut next = state.clone();
        next.functions.remove(&id);
        self.save(&next).await?;
        *state = next;

        info!(function_id = id, "Function deleted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::function::Language;

    fn metadata(name: &str, language: Language) -> FunctionMetadata {
        FunctionMetadata {
            name: name.to_string(),
            route: format!("/{}", name),
            language,
            timeout: 5,
        }
    }

    #[tokio::test]
    async fn test_crud_in_memory() {
        let store = FunctionStore::in_memory();
        let a = store
            .create(metadata("a", Language::Python))
            .await
            .unwrap();
        let b = store
            .create(metadata("b", Language::Javascript))
            .await
            .unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.list().await, vec![a.clone(), b.clone()]);

        let updated = store
            .update(a.id, FunctionMetadata {
                timeout: 9,
                ..metadata("a2", Language::Python)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, a.id);
        assert_eq!(updated.timeout_secs, 9);
        assert_eq!(store.get(a.id).await, Some(updated));

        assert!(store.delete(a.id).await.unwrap());
        assert!(!store.delete(a.id).await.unwrap());
        assert_eq!(store.get(a.id).await, None);
        assert!(
            store
                .update(a.id, metadata("a", Language::Python))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let store = FunctionStore::in_memory();
        let a = store
            .create(metadata("a", Language::Python))
            .await
            .unwrap();
        store.delete(a.id).await.unwrap();
        let b = store
            .create(metadata("b", Language::Python))
            .await
            .unwrap();
        assert_eq!(b.id, 2);
    }

    #[tokio::test]
    async fn test_invalid_metadata_rejected() {
        let store = FunctionStore::in_memory();
        let result = store.create(metadata("  ", Language::Python)).await;
        assert!(result.is_err());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("functions.json");

        let store = FunctionStore::open(&path).await.unwrap();
        store
            .create(metadata("a", Language::Python))
            .await
            .unwrap();
        let b = store
            .create(metadata("b", Language::Javascript))
            .await
            .unwrap();
        store.delete(1).await.unwrap();
        assert!(path.exists());

        let reopened = FunctionStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await, vec![b]);
        let c = reopened
            .create(metadata("c", Language::Python))
            .await
            .unwrap();
        assert_eq!(c.id, 3);
    }

    #[tokio::test]
    async fn test_corrupt_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("functions.json");
        std::fs::write(&path, "{oops").unwrap();

        let store = FunctionStore::open(&path).await.unwrap();
        assert!(store.list().await.is_empty());
    }
}
