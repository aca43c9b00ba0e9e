//! Sync client for Memo snapshot synchronization.
//!
//! This module runs one sync cycle against the remote snapshot:
//! - Pull the snapshot (a failed pull merges against an empty remote)
//! - Merge it with local state
//! - Write changed note lists back locally
//! - Push the merged snapshot
//!
//! It also performs the one-time restore used when a device starts with no
//! local notes.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::Value;

use crate::config::{Config, StorageConfig};
use crate::database::{Database, MEMOS_KEY, PINNED_MEMOS_KEY};
use crate::error::{MemoError, MemoResult};
use crate::events::{ChangePart, EventBus};
use crate::merge::merge;
use crate::models::{parse_entries, Note, NoteSet, SettingsBag, Snapshot, Tombstone};
use crate::remote::RemoteStore;
use crate::validation::validate_object_key;

/// Result of a sync cycle
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    /// A remote snapshot was downloaded and merged
    pub pulled: bool,
    /// The merged snapshot was uploaded
    pub uploaded: bool,
    pub notes: usize,
    pub pinned: usize,
    pub tombstones: usize,
    pub notes_changed: bool,
    pub pinned_changed: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

/// Result of a startup restore
#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    /// A remote snapshot existed and was applied
    pub restored: bool,
    pub notes: usize,
    pub pinned: usize,
    pub tombstones: usize,
    pub settings: usize,
    pub warnings: Vec<String>,
}

/// Sync client
pub struct SyncClient<R> {
    db: Arc<Mutex<Database>>,
    remote: Arc<R>,
    bus: EventBus,
    object_key: String,
    max_inline_blob_bytes: usize,
}

impl<R: RemoteStore> SyncClient<R> {
    /// Create a new sync client
    pub fn new(
        db: Arc<Mutex<Database>>,
        remote: Arc<R>,
        bus: EventBus,
        object_key: impl Into<String>,
    ) -> MemoResult<Self> {
        let object_key = object_key.into();
        validate_object_key(&object_key)?;

        Ok(Self {
            db,
            remote,
            bus,
            object_key,
            max_inline_blob_bytes: StorageConfig::default().max_inline_blob_bytes,
        })
    }

    /// Create a sync client using the configured object key and blob threshold
    pub fn from_config(
        db: Arc<Mutex<Database>>,
        remote: Arc<R>,
        bus: EventBus,
        config: &Config,
    ) -> MemoResult<Self> {
        Ok(Self::new(db, remote, bus, config.cloud_sync().object_key.as_str())?
            .with_inline_blob_threshold(config.storage().max_inline_blob_bytes))
    }

    /// Size above which inline `data:` blobs are dropped when a local write
    /// exceeds the store quota
    pub fn with_inline_blob_threshold(mut self, bytes: usize) -> Self {
        self.max_inline_blob_bytes = bytes;
        self
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    pub fn provider_name(&self) -> &'static str {
        self.remote.provider_name()
    }

    fn lock_db(&self) -> MemoResult<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| MemoError::database_op("database lock poisoned"))
    }

    /// True if either local note list holds a note
    pub fn has_local_notes(&self) -> MemoResult<bool> {
        self.lock_db()?.has_local_notes()
    }

    fn read_local(&self) -> MemoResult<(NoteSet, SettingsBag)> {
        let db = self.lock_db()?;
        Ok((db.load_note_set()?, db.collect_settings()?))
    }

    /// Run one full cycle: pull, merge, write back, push.
    ///
    /// Never panics or returns early on a remote failure; everything that
    /// went wrong is reported in the result.
    pub async fn run_cycle(&self) -> SyncResult {
        let (local, settings) = match self.read_local() {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read local state for sync");
                return SyncResult::failure(format!("Failed to read local state: {}", e));
            }
        };

        let mut result = SyncResult::success();

        // Step 1: Pull
        let remote = match self.remote.download_json(&self.object_key).await {
            Ok(Some(value)) => {
                result.pulled = true;
                Snapshot::from_value_lenient(&value).note_set()
            }
            Ok(None) => {
                tracing::info!(key = %self.object_key, "No remote snapshot yet");
                NoteSet::default()
            }
            Err(e) => {
                tracing::warn!(
                    key = %self.object_key,
                    provider = self.remote.provider_name(),
                    error = %e,
                    "Pull failed, merging local data only"
                );
                result.warnings.push(format!("Pull failed: {}", e));
                NoteSet::default()
            }
        };

        // Step 2: Merge
        let merged = merge(&local, &remote);
        result.notes = merged.notes.len();
        result.pinned = merged.pinned.len();
        result.tombstones = merged.tombstones.len();

        // Step 3: Write back
        if let Err(e) = self.write_back(&local, &merged, &mut result) {
            tracing::error!(error = %e, "Failed to write merged state locally");
            result.errors.push(format!("Local write failed: {}", e));
        }

        // Step 4: Push
        let snapshot = Snapshot::new(merged, settings);
        match self.push(&snapshot).await {
            Ok(()) => {
                result.uploaded = true;
                let now = Utc::now().timestamp_millis();
                if let Err(e) = self.lock_db().and_then(|db| db.set_last_cloud_sync_at(now)) {
                    result
                        .warnings
                        .push(format!("Failed to record sync time: {}", e));
                }
            }
            Err(e) => {
                tracing::error!(
                    key = %self.object_key,
                    provider = self.remote.provider_name(),
                    error = %e,
                    "Push failed, local changes kept"
                );
                result.errors.push(format!("Push failed: {}", e));
            }
        }

        result.success = result.errors.is_empty();

        tracing::info!(
            success = result.success,
            pulled = result.pulled,
            uploaded = result.uploaded,
            notes = result.notes,
            pinned = result.pinned,
            tombstones = result.tombstones,
            "Sync cycle finished"
        );

        result
    }

    async fn push(&self, snapshot: &Snapshot) -> MemoResult<()> {
        let payload = serde_json::to_value(snapshot)?;
        self.remote.upload_json(&self.object_key, &payload).await?;
        Ok(())
    }

    fn write_back(&self, local: &NoteSet, merged: &NoteSet, result: &mut SyncResult) -> MemoResult<()> {
        let db = self.lock_db()?;

        let notes = serde_json::to_value(&merged.notes)?;
        if notes != serde_json::to_value(&local.notes)? {
            result.notes_changed = self.store_list(&db, MEMOS_KEY, &notes, result);
            if result.notes_changed {
                self.bus.publish(ChangePart::SyncMemos);
            }
        }

        let pinned = serde_json::to_value(&merged.pinned)?;
        if pinned != serde_json::to_value(&local.pinned)? {
            result.pinned_changed = self.store_list(&db, PINNED_MEMOS_KEY, &pinned, result);
            if result.pinned_changed {
                self.bus.publish(ChangePart::SyncPinned);
            }
        }

        db.save_tombstones(&merged.tombstones)?;
        Ok(())
    }

    /// Write a merged list, falling back to a reduced copy on quota errors.
    /// A write that still fails is skipped and reported as a warning.
    fn store_list(&self, db: &Database, key: &str, value: &Value, result: &mut SyncResult) -> bool {
        match db.set_json_reducing(key, value, self.max_inline_blob_bytes) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Skipping local write");
                result.warnings.push(format!("Skipped writing {}: {}", key, e));
                false
            }
        }
    }

    /// Hydrate an empty device from the remote snapshot without pushing.
    ///
    /// Only fields the snapshot actually carries as arrays replace local
    /// lists. A missing snapshot or a failed pull leaves local state as is.
    pub async fn restore_from_remote(&self) -> RestoreResult {
        let mut result = RestoreResult::default();

        let value = match self.remote.download_json(&self.object_key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                tracing::info!(key = %self.object_key, "Nothing to restore");
                return result;
            }
            Err(e) => {
                tracing::warn!(key = %self.object_key, error = %e, "Restore pull failed");
                result.warnings.push(format!("Restore failed: {}", e));
                return result;
            }
        };

        if let Err(e) = self.apply_restore(&value, &mut result) {
            tracing::warn!(error = %e, "Restore could not be applied");
            result.warnings.push(format!("Restore failed: {}", e));
            return result;
        }

        result.restored = true;
        self.bus.publish(ChangePart::RestoreRemote);

        tracing::info!(
            notes = result.notes,
            pinned = result.pinned,
            tombstones = result.tombstones,
            settings = result.settings,
            "Restored local state from remote snapshot"
        );

        result
    }

    fn apply_restore(&self, value: &Value, result: &mut RestoreResult) -> MemoResult<()> {
        let db = self.lock_db()?;

        if let Some(raw) = value.get("memos").filter(|v| v.is_array()) {
            let notes: Vec<Note> = parse_entries(Some(raw), "memos");
            result.notes = notes.len();
            db.set_json_reducing(MEMOS_KEY, &serde_json::to_value(&notes)?, self.max_inline_blob_bytes)?;
        }
        if let Some(raw) = value.get("pinnedMemos").filter(|v| v.is_array()) {
            let pinned: Vec<Note> = parse_entries(Some(raw), "pinnedMemos");
            result.pinned = pinned.len();
            db.set_json_reducing(
                PINNED_MEMOS_KEY,
                &serde_json::to_value(&pinned)?,
                self.max_inline_blob_bytes,
            )?;
        }
        if let Some(raw) = value.get("deletedMemoIds").filter(|v| v.is_array()) {
            let tombstones: Vec<Tombstone> = parse_entries(Some(raw), "deletedMemoIds");
            result.tombstones = tombstones.len();
            db.save_tombstones(&tombstones)?;
        }

        let settings = Snapshot::from_value_lenient(value).settings;
        result.settings = db
            .apply_restored_settings(&settings, self.max_inline_blob_bytes)?
            .len();

        Ok(())
    }
}
