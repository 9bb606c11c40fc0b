use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::entry::PrintEntry;
use crate::errors::PersistenceError;

/// Durable home for the serialized gallery. One value, rewritten wholesale.
#[async_trait]
pub trait GalleryPersistence: Send + Sync {
    async fn load(&self) -> Result<Option<String>, PersistenceError>;
    async fn save(&self, payload: &str) -> Result<(), PersistenceError>;
    async fn remove(&self) -> Result<(), PersistenceError>;
    fn type_name(&self) -> &'static str;
}

fn check_quota(payload: &str, quota: usize) -> Result<(), PersistenceError> {
    if payload.len() > quota {
        return Err(PersistenceError::QuotaExceeded {
            size: payload.len(),
            quota,
        });
    }
    Ok(())
}

// ============================================================================
// SQLite backend
// ============================================================================

pub struct SqlitePersistence {
    pool: SqlitePool,
    key: String,
    quota: usize,
}

impl SqlitePersistence {
    /// Opens (or creates) the database file and applies migrations.
    pub async fn connect(config: &StorageConfig) -> Result<Self, PersistenceError> {
        info!("Opening gallery database at: {:?}", config.database_path);

        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PersistenceError::CreateDirectoryFailed {
                        path: format!("{}: {}", parent.display(), e),
                    }
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        Self::from_pool(pool, config).await
    }

    pub async fn from_pool(pool: SqlitePool, config: &StorageConfig) -> Result<Self, PersistenceError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| PersistenceError::MigrationFailed(e.to_string()))?;

        debug!("Gallery database migrations completed");
        Ok(Self {
            pool,
            key: config.storage_key.clone(),
            quota: config.quota_bytes,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl GalleryPersistence for SqlitePersistence {
    async fn load(&self) -> Result<Option<String>, PersistenceError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_store WHERE key = ?1")
            .bind(&self.key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn save(&self, payload: &str) -> Result<(), PersistenceError> {
        check_quota(payload, self.quota)?;

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.key)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(&self.key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "SQLite"
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Volatile backend with a byte quota; writes can be forced to fail.
pub struct MemoryPersistence {
    value: Mutex<Option<String>>,
    quota: usize,
    fail_writes: AtomicBool,
    fail_removes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new(quota: usize) -> Self {
        Self {
            value: Mutex::new(None),
            quota,
            fail_writes: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_value(quota: usize, value: impl Into<String>) -> Self {
        let persistence = Self::new(quota);
        *persistence.lock() = Some(value.into());
        persistence
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fails `remove` only; saves still go through.
    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Number of save/remove attempts, including failed ones.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_write(&self) -> Result<(), PersistenceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

#[async_trait]
impl GalleryPersistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<String>, PersistenceError> {
        Ok(self.stored())
    }

    async fn save(&self, payload: &str) -> Result<(), PersistenceError> {
        self.begin_write()?;
        check_quota(payload, self.quota)?;
        *self.lock() = Some(payload.to_string());
        Ok(())
    }

    async fn remove(&self) -> Result<(), PersistenceError> {
        self.begin_write()?;
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("removes disabled".to_string()));
        }
        *self.lock() = None;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "Memory"
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptionPatch {
    Applied,
    AlreadyFinal,
    Missing,
}

/// Ordered gallery of committed prints.
///
/// Memory is authoritative: a failed write never rolls back a mutation, it
/// raises the storage-full flag instead, which stays up until `clear`.
pub struct GalleryStore {
    entries: Vec<PrintEntry>,
    storage_full: bool,
    persistence: Arc<dyn GalleryPersistence>,
}

impl GalleryStore {
    pub async fn load(persistence: Arc<dyn GalleryPersistence>) -> Self {
        let entries = match persistence.load().await {
            Ok(Some(payload)) => match serde_json::from_str::<Vec<PrintEntry>>(&payload) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Stored gallery is corrupt, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(
                    "Failed to read gallery from {} storage, starting empty: {}",
                    persistence.type_name(),
                    e
                );
                Vec::new()
            }
        };

        info!("Gallery loaded with {} entries", entries.len());
        Self {
            entries,
            storage_full: false,
            persistence,
        }
    }

    /// Adds a committed print. Returns false for a duplicate id.
    pub async fn append(&mut self, entry: PrintEntry) -> bool {
        if self.get(entry.id()).is_some() {
            warn!("Ignoring duplicate gallery entry {}", entry.id());
            return false;
        }
        self.entries.push(entry);
        self.persist().await;
        true
    }

    pub async fn remove(&mut self, id: &str) -> Option<PrintEntry> {
        let index = self.entries.iter().position(|entry| entry.id() == id)?;
        let removed = self.entries.remove(index);
        self.persist().await;
        Some(removed)
    }

    /// Empties the gallery. When the stored value cannot be deleted it is
    /// overwritten with an empty list instead; if that fails too the
    /// storage-full flag stays raised.
    pub async fn clear(&mut self) {
        self.entries.clear();
        self.storage_full = false;
        if let Err(e) = self.persistence.remove().await {
            error!("Failed to delete stored gallery, overwriting it: {}", e);
            self.persist().await;
        }
    }

    pub async fn resolve_caption(&mut self, id: &str, text: &str) -> CaptionPatch {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id() == id) else {
            return CaptionPatch::Missing;
        };
        if !entry.resolve_caption(text) {
            return CaptionPatch::AlreadyFinal;
        }
        self.persist().await;
        CaptionPatch::Applied
    }

    /// Most recent first.
    pub fn list(&self) -> impl Iterator<Item = &PrintEntry> {
        self.entries.iter().rev()
    }

    pub fn get(&self, id: &str) -> Option<&PrintEntry> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn storage_full(&self) -> bool {
        self.storage_full
    }

    async fn persist(&mut self) {
        let result = match serde_json::to_string(&self.entries) {
            Ok(payload) => self.persistence.save(&payload).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            if !self.storage_full {
                warn!("Gallery could not be persisted, keeping it in memory: {}", e);
            }
            self.storage_full = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn entry(id: &str) -> PrintEntry {
        let captured = Local.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap();
        PrintEntry::new(id, vec![0xFF, 0xD8, 0xFF, 0xE0], captured, 1.25)
    }

    async fn memory_store() -> (GalleryStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::default());
        let store = GalleryStore::load(persistence.clone()).await;
        (store, persistence)
    }

    fn storage_config() -> StorageConfig {
        StorageConfig {
            database_path: "unused.db".into(),
            storage_key: "retro-photos".to_string(),
            quota_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_list_is_most_recent_first() {
        let (mut store, _) = memory_store().await;
        assert!(store.append(entry("a")).await);
        assert!(store.append(entry("b")).await);
        assert!(store.append(entry("c")).await);

        let ids: Vec<&str> = store.list().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_rejected() {
        let (mut store, persistence) = memory_store().await;
        assert!(store.append(entry("a")).await);
        assert!(!store.append(entry("a")).await);
        assert_eq!(store.len(), 1);
        assert_eq!(persistence.write_count(), 1);
    }

    #[tokio::test]
    async fn test_one_write_per_mutation() {
        let (mut store, persistence) = memory_store().await;
        store.append(entry("a")).await;
        store.append(entry("b")).await;
        store.resolve_caption("a", "park").await;
        store.remove("b").await;
        assert_eq!(persistence.write_count(), 4);

        // Removing an unknown id is not a mutation.
        assert!(store.remove("zzz").await.is_none());
        assert_eq!(persistence.write_count(), 4);
    }

    #[tokio::test]
    async fn test_reload_preserves_order_and_fields() {
        let (mut store, persistence) = memory_store().await;
        store.append(entry("a")).await;
        store.append(entry("b")).await;
        store.resolve_caption("b", "14:30 beach walk").await;

        let reloaded = GalleryStore::load(persistence).await;
        let original: Vec<&PrintEntry> = store.list().collect();
        let restored: Vec<&PrintEntry> = reloaded.list().collect();
        assert_eq!(original, restored);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_memory_and_flags() {
        let (mut store, persistence) = memory_store().await;
        persistence.set_fail_writes(true);

        assert!(store.append(entry("a")).await);
        assert_eq!(store.len(), 1);
        assert!(store.storage_full());

        persistence.set_fail_writes(false);
        store.append(entry("b")).await;
        assert!(store.storage_full(), "flag is sticky until clear");

        assert!(store.remove("a").await.is_some());
        assert_eq!(store.len(), 1);

        store.clear().await;
        assert!(store.is_empty());
        assert!(!store.storage_full());
        assert_eq!(persistence.stored(), None);
    }

    #[tokio::test]
    async fn test_clear_overwrites_when_delete_fails() {
        let (mut store, persistence) = memory_store().await;
        store.append(entry("a")).await;
        persistence.set_fail_removes(true);

        store.clear().await;
        assert!(store.is_empty());
        assert!(!store.storage_full());
        assert_eq!(persistence.stored().as_deref(), Some("[]"));

        let reloaded = GalleryStore::load(persistence).await;
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_clear_keeps_flag_when_nothing_can_be_written() {
        let (mut store, persistence) = memory_store().await;
        store.append(entry("a")).await;
        let before = persistence.stored();
        persistence.set_fail_writes(true);

        store.clear().await;
        assert!(store.is_empty());
        assert!(store.storage_full());
        assert_eq!(persistence.stored(), before);
    }

    #[tokio::test]
    async fn test_quota_raises_storage_full() {
        let persistence = Arc::new(MemoryPersistence::new(64));
        let mut store = GalleryStore::load(persistence.clone()).await;
        store.append(entry("a")).await;
        assert!(store.storage_full());
        assert_eq!(store.len(), 1);
        assert_eq!(persistence.stored(), None);
    }

    #[tokio::test]
    async fn test_corrupt_payload_loads_empty() {
        let persistence = Arc::new(MemoryPersistence::with_value(usize::MAX, "{not json"));
        let store = GalleryStore::load(persistence).await;
        assert!(store.is_empty());
        assert!(!store.storage_full());
    }

    #[tokio::test]
    async fn test_caption_patch_outcomes() {
        let (mut store, _) = memory_store().await;
        store.append(entry("a")).await;

        assert_eq!(store.resolve_caption("a", "first").await, CaptionPatch::Applied);
        assert_eq!(
            store.resolve_caption("a", "second").await,
            CaptionPatch::AlreadyFinal
        );
        assert_eq!(store.resolve_caption("gone", "x").await, CaptionPatch::Missing);
        assert_eq!(store.get("a").unwrap().caption().text(""), "first");
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_quota() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let sqlite = SqlitePersistence::from_pool(pool, &storage_config())
            .await
            .unwrap();

        assert_eq!(sqlite.load().await.unwrap(), None);
        sqlite.save("[]").await.unwrap();
        sqlite.save("[1]").await.unwrap();
        assert_eq!(sqlite.load().await.unwrap().as_deref(), Some("[1]"));

        let too_big = "x".repeat(2048);
        assert!(matches!(
            sqlite.save(&too_big).await,
            Err(PersistenceError::QuotaExceeded { size: 2048, quota: 1024 })
        ));
        assert_eq!(sqlite.load().await.unwrap().as_deref(), Some("[1]"));

        sqlite.remove().await.unwrap();
        assert_eq!(sqlite.load().await.unwrap(), None);
    }
}
