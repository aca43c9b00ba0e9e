//! Note operations for Memo.
//!
//! Thin layer over the local store that applies a user action to the right
//! list, records tombstones for deletions and publishes the change event the
//! sync scheduler listens to.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::config::{Config, StorageConfig};
use crate::database::{Database, WriteOutcome};
use crate::error::{MemoError, MemoResult};
use crate::events::{ChangePart, EventBus};
use crate::models::{Note, SettingsSection, TimeValue, Tombstone};
use crate::validation::{validate_note_content, validate_note_id};

pub struct Notebook {
    db: Arc<Mutex<Database>>,
    bus: EventBus,
    max_inline_blob_bytes: usize,
}

impl Notebook {
    pub fn new(db: Arc<Mutex<Database>>, bus: EventBus) -> Self {
        Self {
            db,
            bus,
            max_inline_blob_bytes: StorageConfig::default().max_inline_blob_bytes,
        }
    }

    /// Create a notebook using the configured inline blob threshold
    pub fn from_config(db: Arc<Mutex<Database>>, bus: EventBus, config: &Config) -> Self {
        Self::new(db, bus).with_inline_blob_threshold(config.storage().max_inline_blob_bytes)
    }

    pub fn with_inline_blob_threshold(mut self, bytes: usize) -> Self {
        self.max_inline_blob_bytes = bytes;
        self
    }

    fn lock_db(&self) -> MemoResult<MutexGuard<'_, Database>> {
        self.db
            .lock()
            .map_err(|_| MemoError::database_op("database lock poisoned"))
    }

    /// Create a note at the top of the regular list
    pub fn create_note(&self, content: &str) -> MemoResult<Note> {
        validate_note_content(content)?;
        let note = Note::new(content.to_string());

        {
            let db = self.lock_db()?;
            let mut notes = db.load_notes()?;
            notes.insert(0, note.clone());
            db.save_notes(&notes)?;
        }

        tracing::debug!(note_id = %note.id, "Created note");
        self.bus.publish(ChangePart::Memo);
        Ok(note)
    }

    /// Replace a note's content, wherever it lives
    pub fn update_note(&self, id: &str, content: &str) -> MemoResult<Note> {
        validate_note_id(id)?;
        validate_note_content(content)?;

        let (note, part) = {
            let db = self.lock_db()?;

            let mut pinned = db.load_pinned()?;
            if let Some(note) = pinned.iter_mut().find(|n| n.id == id) {
                note.content = content.to_string();
                note.touch();
                let updated = note.clone();
                db.save_pinned(&pinned)?;
                (updated, ChangePart::Pinned)
            } else {
                let mut notes = db.load_notes()?;
                let note = notes
                    .iter_mut()
                    .find(|n| n.id == id)
                    .ok_or_else(|| MemoError::NotFound(format!("note {}", id)))?;
                note.content = content.to_string();
                note.touch();
                let updated = note.clone();
                db.save_notes(&notes)?;
                (updated, ChangePart::Memo)
            }
        };

        self.bus.publish(part);
        Ok(note)
    }

    /// Delete a note and record a tombstone so other devices drop it too.
    ///
    /// The tombstone is written even when the note is not present locally.
    /// Returns whether a local copy was removed.
    pub fn delete_note(&self, id: &str) -> MemoResult<bool> {
        validate_note_id(id)?;

        let (from_notes, from_pinned) = {
            let db = self.lock_db()?;

            let mut notes = db.load_notes()?;
            let before = notes.len();
            notes.retain(|n| n.id != id);
            let from_notes = notes.len() != before;
            if from_notes {
                db.save_notes(&notes)?;
            }

            let mut pinned = db.load_pinned()?;
            let before = pinned.len();
            pinned.retain(|n| n.id != id);
            let from_pinned = pinned.len() != before;
            if from_pinned {
                db.save_pinned(&pinned)?;
            }

            db.add_tombstone(Tombstone::new(id))?;
            (from_notes, from_pinned)
        };

        tracing::debug!(note_id = %id, "Deleted note");
        if from_pinned {
            self.bus.publish(ChangePart::Pinned);
        }
        if from_notes || !from_pinned {
            self.bus.publish(ChangePart::Memo);
        }
        Ok(from_notes || from_pinned)
    }

    /// Move a note to the top of the pinned list
    pub fn pin_note(&self, id: &str) -> MemoResult<Note> {
        validate_note_id(id)?;

        let note = {
            let db = self.lock_db()?;
            let mut pinned = db.load_pinned()?;
            if let Some(existing) = pinned.iter().find(|n| n.id == id) {
                return Ok(existing.clone());
            }

            let mut notes = db.load_notes()?;
            let index = notes
                .iter()
                .position(|n| n.id == id)
                .ok_or_else(|| MemoError::NotFound(format!("note {}", id)))?;
            let mut note = notes.remove(index);
            note.set_pin(Some(TimeValue::now()));

            pinned.insert(0, note.clone());
            db.save_pinned(&pinned)?;
            db.save_notes(&notes)?;
            note
        };

        self.bus.publish(ChangePart::Pinned);
        self.bus.publish(ChangePart::Memo);
        Ok(note)
    }

    /// Move a pinned note back to the regular list.
    ///
    /// Bumps `updatedAt`: an equally old pinned copy elsewhere would
    /// otherwise pin it again on the next merge.
    pub fn unpin_note(&self, id: &str) -> MemoResult<Note> {
        validate_note_id(id)?;

        let note = {
            let db = self.lock_db()?;
            let mut pinned = db.load_pinned()?;
            let index = pinned
                .iter()
                .position(|n| n.id == id)
                .ok_or_else(|| MemoError::NotFound(format!("pinned note {}", id)))?;
            let mut note = pinned.remove(index);
            note.set_pin(None);
            note.touch();

            let mut notes = db.load_notes()?;
            notes.insert(0, note.clone());
            db.save_notes(&notes)?;
            db.save_pinned(&pinned)?;
            note
        };

        self.bus.publish(ChangePart::Pinned);
        self.bus.publish(ChangePart::Memo);
        Ok(note)
    }

    /// Look a note up by id, pinned list first
    pub fn find_note(&self, id: &str) -> MemoResult<Option<Note>> {
        let set = self.lock_db()?.load_note_set()?;
        Ok(set.find(id).cloned())
    }

    /// All notes, pinned ones first
    pub fn list_notes(&self) -> MemoResult<Vec<Note>> {
        let set = self.lock_db()?.load_note_set()?;
        Ok(set.pinned.into_iter().chain(set.notes).collect())
    }

    /// Save a settings section, dropping large inline blobs if the store
    /// quota rejects the full value
    pub fn save_setting(&self, section: SettingsSection, value: &Value) -> MemoResult<WriteOutcome> {
        let outcome = self.lock_db()?.set_json_reducing(
            section.store_key(),
            value,
            self.max_inline_blob_bytes,
        )?;
        self.bus.publish(ChangePart::Settings(section));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn notebook() -> (Notebook, Arc<Mutex<Database>>, EventBus) {
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let bus = EventBus::new();
        (Notebook::new(db.clone(), bus.clone()), db, bus)
    }

    #[test]
    fn test_create_and_find() {
        let (notebook, _db, bus) = notebook();
        let mut rx = bus.subscribe();

        let first = notebook.create_note("first").unwrap();
        let second = notebook.create_note("second").unwrap();

        let listed = notebook.list_notes().unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(notebook.find_note(&first.id).unwrap().unwrap().content, "first");
        assert!(notebook.find_note("missing").unwrap().is_none());
        assert_eq!(rx.try_recv().unwrap().part, ChangePart::Memo);
    }

    #[test]
    fn test_update_note() {
        let (notebook, _db, _bus) = notebook();
        let note = notebook.create_note("draft").unwrap();

        let updated = notebook.update_note(&note.id, "final").unwrap();
        assert_eq!(updated.content, "final");
        assert_eq!(notebook.find_note(&note.id).unwrap().unwrap().content, "final");
        assert!(matches!(
            notebook.update_note("nope", "x"),
            Err(MemoError::NotFound(_))
        ));
    }

    #[test]
    fn test_pin_and_unpin() {
        let (notebook, db, bus) = notebook();
        let note = notebook.create_note("pin me").unwrap();
        let mut rx = bus.subscribe();

        let pinned = notebook.pin_note(&note.id).unwrap();
        assert_eq!(pinned.is_pinned, Some(true));
        assert!(pinned.pinned_at.is_some());
        {
            let db = db.lock().unwrap();
            assert!(db.load_notes().unwrap().is_empty());
            assert_eq!(db.load_pinned().unwrap().len(), 1);
        }
        assert_eq!(rx.try_recv().unwrap().part, ChangePart::Pinned);
        assert_eq!(rx.try_recv().unwrap().part, ChangePart::Memo);

        // Pinning twice is a no-op
        notebook.pin_note(&note.id).unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let unpinned = notebook.unpin_note(&note.id).unwrap();
        assert_eq!(unpinned.is_pinned, None);
        assert_eq!(unpinned.pinned_at, None);
        let db = db.lock().unwrap();
        assert_eq!(db.load_notes().unwrap().len(), 1);
        assert!(db.load_pinned().unwrap().is_empty());
    }

    #[test]
    fn test_update_pinned_note_publishes_pinned() {
        let (notebook, _db, bus) = notebook();
        let note = notebook.create_note("a").unwrap();
        notebook.pin_note(&note.id).unwrap();
        let mut rx = bus.subscribe();

        notebook.update_note(&note.id, "b").unwrap();
        assert_eq!(rx.try_recv().unwrap().part, ChangePart::Pinned);
    }

    #[test]
    fn test_delete_records_tombstone() {
        let (notebook, db, _bus) = notebook();
        let note = notebook.create_note("bye").unwrap();

        assert!(notebook.delete_note(&note.id).unwrap());
        assert!(!notebook.delete_note("never-existed").unwrap());

        let db = db.lock().unwrap();
        assert!(db.load_notes().unwrap().is_empty());
        let tombstones = db.load_tombstones().unwrap();
        assert_eq!(tombstones.len(), 2);
        assert!(tombstones.iter().all(|t| t.deleted_millis() > 0));
    }

    #[test]
    fn test_invalid_input_is_rejected() {
        let (notebook, _db, _bus) = notebook();
        assert!(matches!(
            notebook.delete_note(""),
            Err(MemoError::Validation { .. })
        ));
        assert!(notebook
            .create_note(&"x".repeat(crate::validation::MAX_NOTE_CONTENT_LENGTH + 1))
            .is_err());
    }

    #[test]
    fn test_save_setting_publishes_section() {
        let (notebook, db, bus) = notebook();
        let mut rx = bus.subscribe();

        let outcome = notebook
            .save_setting(SettingsSection::ThemeColor, &json!("#222222"))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Stored);
        assert_eq!(
            rx.try_recv().unwrap().part,
            ChangePart::Settings(SettingsSection::ThemeColor)
        );
        assert_eq!(
            db.lock().unwrap().load_setting(SettingsSection::ThemeColor).unwrap(),
            json!("#222222")
        );
    }

    #[test]
    fn test_save_setting_reduces_over_quota() {
        let (notebook, db, _bus) = notebook();
        db.lock().unwrap().set_max_value_bytes(Some(300));

        let value = json!({"imageUrl": format!("data:image/jpeg;base64,{}", "Q".repeat(1000))});
        let outcome = notebook
            .with_inline_blob_threshold(100)
            .save_setting(SettingsSection::Avatar, &value)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Reduced { stripped: 1 });
    }

    #[test]
    fn test_from_config_uses_storage_limits() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::new(Some(temp_dir.path().to_path_buf())).unwrap();
        config.set_max_value_bytes(Some(300)).unwrap();
        config.set_max_inline_blob_bytes(100).unwrap();

        let db = Arc::new(Mutex::new(Database::from_config(&config).unwrap()));
        let notebook = Notebook::from_config(db, EventBus::new(), &config);
        assert_eq!(notebook.max_inline_blob_bytes, 100);

        let value = json!({"imageUrl": format!("data:image/jpeg;base64,{}", "Q".repeat(1000))});
        let outcome = notebook.save_setting(SettingsSection::Avatar, &value).unwrap();
        assert_eq!(outcome, WriteOutcome::Reduced { stripped: 1 });
    }
}
