//! Local record store for Memo.
//!
//! Every collection (notes, pinned notes, tombstones) and every settings
//! section is serialized to JSON and kept under its own key in a single
//! SQLite key-value table. Reads are forgiving: a missing or unparseable
//! value reads as the caller's fallback, never as an error.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::{MemoError, MemoResult};
use crate::models::{parse_entries, Note, NoteSet, SettingsBag, SettingsSection, Tombstone};

/// Key of the regular note list
pub const MEMOS_KEY: &str = "memos";

/// Key of the pinned note list
pub const PINNED_MEMOS_KEY: &str = "pinnedMemos";

/// Key of the tombstone list
pub const TOMBSTONES_KEY: &str = "deletedMemoTombstones";

/// Key of the epoch-millisecond time of the last successful push
pub const LAST_CLOUD_SYNC_KEY: &str = "lastCloudSyncAt";

/// How a write ended up in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Stored as given
    Stored,
    /// Stored after dropping this many inline blobs to fit the quota
    Reduced { stripped: usize },
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
    max_value_bytes: Option<usize>,
}

impl Database {
    /// Create a new database connection
    pub fn new<P: AsRef<Path>>(db_path: P) -> MemoResult<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let mut db = Self {
            conn,
            max_value_bytes: None,
        };
        db.init_database()?;
        Ok(db)
    }

    /// Open the database named by the configuration and apply its store quota
    pub fn from_config(config: &Config) -> MemoResult<Self> {
        let path = match config.database_file() {
            "" => config.config_dir().join("memo.db"),
            file => Path::new(file).to_path_buf(),
        };
        let mut db = Self::new(path)?;
        db.set_max_value_bytes(config.storage().max_value_bytes);
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> MemoResult<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self {
            conn,
            max_value_bytes: None,
        };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&mut self) -> MemoResult<()> {
        self.conn.execute_batch(
            r#"
            -- One JSON document per key; updated_at is Unix seconds
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Limit the size of a single stored value (None = unlimited)
    pub fn set_max_value_bytes(&mut self, limit: Option<usize>) {
        self.max_value_bytes = limit;
    }

    /// Get the underlying connection (for advanced operations)
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // Raw key-value access
    // ========================================================================

    /// Read the raw text stored under `key`
    pub fn get_raw(&self, key: &str) -> MemoResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Store raw text under `key`, subject to the per-value quota
    pub fn set_raw(&self, key: &str, value: &str) -> MemoResult<()> {
        if let Some(limit) = self.max_value_bytes {
            if value.len() > limit {
                return Err(MemoError::QuotaExceeded {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                });
            }
        }

        self.conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Remove `key`; returns whether anything was stored
    pub fn remove(&self, key: &str) -> MemoResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(removed > 0)
    }

    /// Read and parse the JSON stored under `key`.
    ///
    /// Unparseable content reads as `None` (and is logged) so that a single
    /// corrupt key never blocks the rest of the application.
    pub fn get_json(&self, key: &str) -> MemoResult<Option<Value>> {
        let Some(raw) = self.get_raw(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ignoring unparseable local value");
                Ok(None)
            }
        }
    }

    /// Serialize `value` to JSON and store it under `key`
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> MemoResult<()> {
        let text = serde_json::to_string(value)?;
        self.set_raw(key, &text)
    }

    /// Store `value`, retrying once without large inline blobs if the quota
    /// rejects the full document.
    pub fn set_json_reducing(
        &self,
        key: &str,
        value: &Value,
        max_inline_blob_bytes: usize,
    ) -> MemoResult<WriteOutcome> {
        match self.set_json(key, value) {
            Ok(()) => Ok(WriteOutcome::Stored),
            Err(e) if e.is_quota_exceeded() => {
                let mut reduced = value.clone();
                let stripped = strip_inline_blobs(&mut reduced, max_inline_blob_bytes);
                if stripped == 0 {
                    return Err(e);
                }
                self.set_json(key, &reduced)?;
                tracing::warn!(
                    key = %key,
                    stripped = stripped,
                    "Stored reduced value after exceeding local quota"
                );
                Ok(WriteOutcome::Reduced { stripped })
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Note collections
    // ========================================================================

    fn load_entries<T>(&self, key: &str) -> MemoResult<Vec<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let value = self.get_json(key)?;
        Ok(parse_entries(value.as_ref(), key))
    }

    /// Regular (unpinned) notes
    pub fn load_notes(&self) -> MemoResult<Vec<Note>> {
        self.load_entries(MEMOS_KEY)
    }

    /// Pinned notes
    pub fn load_pinned(&self) -> MemoResult<Vec<Note>> {
        self.load_entries(PINNED_MEMOS_KEY)
    }

    /// Deletion markers
    pub fn load_tombstones(&self) -> MemoResult<Vec<Tombstone>> {
        self.load_entries(TOMBSTONES_KEY)
    }

    /// Notes, pinned notes and tombstones in one read
    pub fn load_note_set(&self) -> MemoResult<NoteSet> {
        Ok(NoteSet::new(
            self.load_notes()?,
            self.load_pinned()?,
            self.load_tombstones()?,
        ))
    }

    /// True if either note list holds at least one note
    pub fn has_local_notes(&self) -> MemoResult<bool> {
        Ok(!self.load_notes()?.is_empty() || !self.load_pinned()?.is_empty())
    }

    pub fn save_notes(&self, notes: &[Note]) -> MemoResult<()> {
        self.set_json(MEMOS_KEY, notes)
    }

    pub fn save_pinned(&self, notes: &[Note]) -> MemoResult<()> {
        self.set_json(PINNED_MEMOS_KEY, notes)
    }

    pub fn save_tombstones(&self, tombstones: &[Tombstone]) -> MemoResult<()> {
        self.set_json(TOMBSTONES_KEY, tombstones)
    }

    /// Record a deletion, keeping the later time if the id is already known.
    pub fn add_tombstone(&self, tombstone: Tombstone) -> MemoResult<()> {
        let mut tombstones = self.load_tombstones()?;
        match tombstones.iter_mut().find(|t| t.id == tombstone.id) {
            Some(existing) => {
                if tombstone.deleted_millis() > existing.deleted_millis() {
                    *existing = tombstone;
                }
            }
            None => tombstones.push(tombstone),
        }
        self.save_tombstones(&tombstones)
    }

    // ========================================================================
    // Settings sections
    // ========================================================================

    /// Stored value of a settings section, or its default
    pub fn load_setting(&self, section: SettingsSection) -> MemoResult<Value> {
        Ok(self
            .get_json(section.store_key())?
            .unwrap_or_else(|| section.default_value()))
    }

    pub fn save_setting(&self, section: SettingsSection, value: &Value) -> MemoResult<()> {
        self.set_json(section.store_key(), value)
    }

    /// All settings sections as carried in a snapshot
    pub fn collect_settings(&self) -> MemoResult<SettingsBag> {
        let mut bag = SettingsBag::new();
        for section in SettingsSection::ALL {
            bag.insert(section, self.load_setting(section)?);
        }
        Ok(bag)
    }

    /// Overwrite local settings sections with the ones pulled from a remote
    /// snapshot. Sections the snapshot does not carry (or carries empty) are
    /// left alone. Returns the sections that were written.
    pub fn apply_restored_settings(
        &self,
        settings: &SettingsBag,
        max_inline_blob_bytes: usize,
    ) -> MemoResult<Vec<SettingsSection>> {
        let mut written = Vec::new();
        for section in SettingsSection::ALL {
            let Some(value) = settings.get(section) else {
                continue;
            };
            if !section.accepts_restored(value) {
                continue;
            }

            // Dark mode is kept as "true"/"false" text locally
            let value = match (section, value) {
                (SettingsSection::DarkMode, Value::String(_)) => value.clone(),
                (SettingsSection::DarkMode, other) => Value::String(other.to_string()),
                _ => value.clone(),
            };

            self.set_json_reducing(section.store_key(), &value, max_inline_blob_bytes)?;
            written.push(section);
        }
        Ok(written)
    }

    // ========================================================================
    // Sync bookkeeping
    // ========================================================================

    /// Epoch milliseconds of the last successful push, if any
    pub fn last_cloud_sync_at(&self) -> MemoResult<Option<i64>> {
        Ok(self
            .get_json(LAST_CLOUD_SYNC_KEY)?
            .and_then(|value| value.as_i64()))
    }

    pub fn set_last_cloud_sync_at(&self, millis: i64) -> MemoResult<()> {
        self.set_json(LAST_CLOUD_SYNC_KEY, &millis)
    }
}

/// Replace every `data:` URL string longer than `threshold` bytes with an
/// empty string. Returns how many were replaced.
pub fn strip_inline_blobs(value: &mut Value, threshold: usize) -> usize {
    match value {
        Value::String(s) if s.starts_with("data:") && s.len() > threshold => {
            s.clear();
            1
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| strip_inline_blobs(item, threshold))
            .sum(),
        Value::Object(map) => map
            .values_mut()
            .map(|item| strip_inline_blobs(item, threshold))
            .sum(),
        _ => 0,
    }
}
