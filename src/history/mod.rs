//! History module - per-user exchange records and model modes
//!
//! This module provides the conversation history layer for ChatRelay:
//! - The [`HistoryStore`] contract the orchestration loop consumes
//!   (load recent exchanges, append an exchange, get/set the user's mode)
//! - [`HistoryManager`], the default store: in-memory cache with optional
//!   per-user JSON file persistence
//!
//! # Example
//!
//! ```
//! use chatrelay::history::{Exchange, HistoryManager, HistoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = HistoryManager::new_memory();
//!
//!     store
//!         .append_exchange("user1", Exchange::new("Hello!", "Hi there!"))
//!         .await
//!         .unwrap();
//!
//!     let recent = store.load_recent_exchanges("user1", 10).await.unwrap();
//!     assert_eq!(recent.len(), 1);
//! }
//! ```

pub mod types;

pub use types::{ChatMessage, Exchange, Role, ToolInvocation, UserHistory};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::Result;

/// Storage contract consumed by the orchestration loop.
///
/// Implementations must return exchanges oldest-first. The engine only ever
/// appends finished exchanges; it never rewrites history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load up to `limit` most recent exchanges for the user, oldest first.
    async fn load_recent_exchanges(&self, user_id: &str, limit: usize) -> Result<Vec<Exchange>>;

    /// Append one finished exchange to the user's history.
    async fn append_exchange(&self, user_id: &str, exchange: Exchange) -> Result<()>;

    /// The user's preferred model mode, if set.
    async fn get_user_mode(&self, user_id: &str) -> Result<Option<String>>;

    /// Set or clear the user's preferred model mode.
    async fn set_user_mode(&self, user_id: &str, mode: Option<String>) -> Result<()>;
}

/// Default history store with an in-memory cache and optional file
/// persistence.
///
/// Each user's record is one [`UserHistory`] value, persisted as
/// `<storage>/<user>.json` when persistence is enabled.
///
/// # Thread Safety
///
/// The manager uses `Arc<RwLock>` internally, making it safe to clone and
/// share across async tasks. Appends take the write lock for the whole
/// read-modify cycle so concurrent rounds for different users never lose
/// updates.
pub struct HistoryManager {
    /// In-memory cache of user records
    users: Arc<RwLock<HashMap<String, UserHistory>>>,
    /// Optional directory for file-based persistence
    storage_path: Option<PathBuf>,
}

impl HistoryManager {
    /// Create a history manager with file-based persistence.
    ///
    /// Records are stored under `~/.chatrelay/history/` as JSON files. The
    /// directory is created if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the history directory cannot be created.
    ///
    /// # Example
    /// ```no_run
    /// use chatrelay::history::HistoryManager;
    ///
    /// let store = HistoryManager::new().unwrap();
    /// ```
    pub fn new() -> Result<Self> {
        let storage_path = Config::dir().join("history");
        std::fs::create_dir_all(&storage_path)?;
        Ok(Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(storage_path),
        })
    }

    /// Create an in-memory history manager without persistence.
    ///
    /// This is what the tests use, and what the engine falls back to when no
    /// data directory is wanted.
    pub fn new_memory() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            storage_path: None,
        }
    }

    /// Create a history manager with a custom storage directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    ///
    /// # Example
    /// ```no_run
    /// use chatrelay::history::HistoryManager;
    /// use std::path::PathBuf;
    ///
    /// let store = HistoryManager::with_path(PathBuf::from("/tmp/history")).unwrap();
    /// ```
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            users: Arc::new(RwLock::new(HashMap::new())),
            storage_path: Some(path),
        })
    }

    /// Get a user's record without creating it.
    ///
    /// Checks the in-memory cache first, then disk when persistence is
    /// enabled (caching the loaded record).
    ///
    /// # Errors
    ///
    /// Returns an error if loading from disk fails.
    pub async fn get(&self, user_id: &str) -> Result<Option<UserHistory>> {
        {
            let users = self.users.read().await;
            if let Some(record) = users.get(user_id) {
                return Ok(Some(record.clone()));
            }
        }

        if let Some(record) = self.read_from_disk(user_id).await? {
            let mut users = self.users.write().await;
            users.insert(user_id.to_string(), record.clone());
            return Ok(Some(record));
        }

        Ok(None)
    }

    /// Delete a user's record from both memory and disk.
    ///
    /// # Errors
    ///
    /// Returns an error if deleting from disk fails.
    pub async fn delete(&self, user_id: &str) -> Result<()> {
        {
            let mut users = self.users.write().await;
            users.remove(user_id);
        }

        if let Some(ref storage_path) = self.storage_path {
            let file_path = storage_path.join(format!("{}.json", Self::sanitize_key(user_id)));
            if file_path.exists() {
                tokio::fs::remove_file(&file_path).await?;
            }
        }

        Ok(())
    }

    /// List all known user ids, from memory and disk, sorted and de-duplicated.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the storage directory fails.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        {
            let users = self.users.read().await;
            ids.extend(users.keys().cloned());
        }

        if let Some(ref storage_path) = self.storage_path {
            let mut dir_entries = tokio::fs::read_dir(storage_path).await?;
            while let Some(entry) = dir_entries.next_entry().await? {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    if let Some(stem) = path.file_stem() {
                        let id = stem.to_string_lossy().to_string();
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Check whether a user has any record, in memory or on disk.
    pub async fn exists(&self, user_id: &str) -> bool {
        {
            let users = self.users.read().await;
            if users.contains_key(user_id) {
                return true;
            }
        }

        if let Some(ref storage_path) = self.storage_path {
            let file_path = storage_path.join(format!("{}.json", Self::sanitize_key(user_id)));
            return file_path.exists();
        }

        false
    }

    /// Clear all records from memory (does not affect disk).
    pub async fn clear_cache(&self) {
        let mut users = self.users.write().await;
        users.clear();
    }

    /// Number of records currently cached in memory.
    pub async fn cache_size(&self) -> usize {
        let users = self.users.read().await;
        users.len()
    }

    /// Mutate a user's record under the write lock, creating it if absent,
    /// then persist the result.
    async fn update<F>(&self, user_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut UserHistory),
    {
        let snapshot = {
            let mut users = self.users.write().await;
            // Pull any persisted record into the cache before mutating, so a
            // fresh process doesn't shadow history already on disk.
            let mut record = match users.remove(user_id) {
                Some(existing) => existing,
                None => self
                    .read_from_disk(user_id)
                    .await?
                    .unwrap_or_else(|| UserHistory::new(user_id)),
            };
            apply(&mut record);
            users.insert(user_id.to_string(), record.clone());
            record
        };

        self.persist(&snapshot).await
    }

    /// Write a record to disk when persistence is enabled.
    async fn persist(&self, record: &UserHistory) -> Result<()> {
        if let Some(ref storage_path) = self.storage_path {
            let file_path =
                storage_path.join(format!("{}.json", Self::sanitize_key(&record.user_id)));
            let content = serde_json::to_string_pretty(record)?;
            tokio::fs::write(&file_path, content).await?;
        }
        Ok(())
    }

    async fn read_from_disk(&self, user_id: &str) -> Result<Option<UserHistory>> {
        if let Some(ref storage_path) = self.storage_path {
            let file_path = storage_path.join(format!("{}.json", Self::sanitize_key(user_id)));
            if file_path.exists() {
                let content = tokio::fs::read_to_string(&file_path).await?;
                let record: UserHistory = serde_json::from_str(&content)?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Sanitize a user id for use as a filename.
    fn sanitize_key(key: &str) -> String {
        key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_")
    }
}

#[async_trait]
impl HistoryStore for HistoryManager {
    async fn load_recent_exchanges(&self, user_id: &str, limit: usize) -> Result<Vec<Exchange>> {
        match self.get(user_id).await? {
            Some(record) => Ok(record.recent(limit).to_vec()),
            None => Ok(Vec::new()),
        }
    }

    async fn append_exchange(&self, user_id: &str, exchange: Exchange) -> Result<()> {
        self.update(user_id, |record| record.add_exchange(exchange))
            .await
    }

    async fn get_user_mode(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.get(user_id).await?.and_then(|record| record.mode))
    }

    async fn set_user_mode(&self, user_id: &str, mode: Option<String>) -> Result<()> {
        self.update(user_id, |record| record.mode = mode).await
    }
}

impl Clone for HistoryManager {
    fn clone(&self) -> Self {
        Self {
            users: Arc::clone(&self.users),
            storage_path: self.storage_path.clone(),
        }
    }
}

impl Default for HistoryManager {
    /// Creates an in-memory history manager.
    ///
    /// Use `HistoryManager::new()` for file-based persistence.
    fn default() -> Self {
        Self::new_memory()
    }
}
