use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::profile::SearchResponse;

/// Slot holding the last completed search.
pub const SEARCH_RESULTS_SLOT: &str = "searchResults";

pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
}

#[derive(Clone)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    fn path(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path(ident))
    }

    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let temp_path = self.path(&format!(
            "{}-{ident}",
            rusty_ulid::generate_ulid_string()
        ));

        std::fs::write(&temp_path, data)?;

        std::fs::rename(&temp_path, self.path(ident))
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        match std::fs::remove_file(self.path(ident)) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// The durable `searchResults` slot. Restored on start-up so the last search
/// survives a restart without re-querying.
#[derive(Clone)]
pub struct ResultSlot {
    store: Arc<dyn StorageManager>,
}

impl ResultSlot {
    pub fn new(store: Arc<dyn StorageManager>) -> Self {
        Self { store }
    }

    /// Last saved response. An unreadable slot is logged and treated as empty.
    pub fn load(&self) -> Option<SearchResponse> {
        if !self.store.exists(SEARCH_RESULTS_SLOT) {
            return None;
        }

        let data = match self.store.read(SEARCH_RESULTS_SLOT) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to read saved search: {e}");
                return None;
            }
        };

        match serde_json::from_slice(&data) {
            Ok(response) => Some(response),
            Err(e) => {
                log::error!("failed to load saved search: {e}");
                None
            }
        }
    }

    pub fn save(&self, response: &SearchResponse) -> anyhow::Result<()> {
        let data = serde_json::to_vec(response)?;
        self.store.write(SEARCH_RESULTS_SLOT, &data)?;
        Ok(())
    }

    pub fn clear(&self) -> std::io::Result<()> {
        self.store.delete(SEARCH_RESULTS_SLOT)
    }

    pub fn is_empty(&self) -> bool {
        !self.store.exists(SEARCH_RESULTS_SLOT)
    }
}
