//! Data models for Memo.
//!
//! This module defines the records that travel between the local store and
//! the remote snapshot: Note, Tombstone, the Snapshot document and the
//! opaque settings bag.
//!
//! Records written by older versions of the application use several
//! timestamp fields (`updatedAt`, `lastModified`, `timestamp`, `createdAt`)
//! holding either ISO-8601 text or epoch milliseconds. Which field counts
//! for which purpose is fixed by the preference lists below.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Version tag written into every snapshot.
pub const SNAPSHOT_VERSION: &str = "s3-sync-v1";

/// A timestamp as stored in a record: epoch milliseconds or ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl TimeValue {
    /// Current time as ISO-8601 text
    pub fn now() -> Self {
        TimeValue::Text(iso_from_millis(Utc::now().timestamp_millis()))
    }

    /// ISO-8601 text for the given epoch milliseconds
    pub fn from_millis(ms: i64) -> Self {
        TimeValue::Text(iso_from_millis(ms))
    }

    /// Whether the value counts as set (non-zero number, non-empty text).
    pub fn is_set(&self) -> bool {
        match self {
            TimeValue::Millis(ms) => *ms != 0,
            TimeValue::Fractional(v) => *v != 0.0 && !v.is_nan(),
            TimeValue::Text(s) => !s.is_empty(),
        }
    }

    /// Epoch milliseconds, 0 when the value cannot be parsed.
    pub fn to_millis(&self) -> i64 {
        match self {
            TimeValue::Millis(ms) => *ms,
            TimeValue::Fractional(v) if v.is_finite() => *v as i64,
            TimeValue::Fractional(_) => 0,
            TimeValue::Text(s) => parse_time_text(s).unwrap_or(0),
        }
    }
}

fn parse_time_text(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Format epoch milliseconds the way the snapshot stores them
/// ("2024-05-01T12:00:00.000Z").
pub fn iso_from_millis(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Timestamp fields a note may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampField {
    CreatedAt,
    UpdatedAt,
    LastModified,
    Timestamp,
    PinnedAt,
}

use TimestampField::{CreatedAt, LastModified, PinnedAt, Timestamp, UpdatedAt};

/// Effective modification time of a note (last-writer-wins key).
pub const UPDATE_TIME_PREFERENCE: &[TimestampField] =
    &[UpdatedAt, LastModified, Timestamp, CreatedAt];

/// Pin time of a copy that came from a pinned list.
pub const PIN_TIME_PREFERENCE: &[TimestampField] = &[PinnedAt, UpdatedAt, CreatedAt];

/// Ordering key of the regular note list (newest first).
pub const MEMO_SORT_PREFERENCE: &[TimestampField] = &[CreatedAt, Timestamp, UpdatedAt];

/// Ordering key of the pinned note list (most recently pinned first).
pub const PINNED_SORT_PREFERENCE: &[TimestampField] = &[PinnedAt, UpdatedAt, CreatedAt];

/// Normalize a JSON string or number to a string id.
///
/// Whole floats lose their fraction (`1.0` becomes `"1"`).
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Some((f as i64).to_string())
            }
            _ => Some(n.to_string()),
        },
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Take `key` out of a raw record if it parses as `T`.
///
/// A value of the wrong shape stays in `raw` so it is written back as-is.
fn take_field<T: DeserializeOwned>(raw: &mut Map<String, Value>, key: &str) -> Option<T> {
    let value = raw.remove(key)?;
    if value.is_null() {
        return None;
    }
    match T::deserialize(&value) {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            raw.insert(key.to_string(), value);
            None
        }
    }
}

fn take_id(raw: &mut Map<String, Value>) -> Result<String, String> {
    match raw.remove("id") {
        None | Some(Value::Null) => Err("record has no id".to_string()),
        Some(value) => {
            id_from_value(&value).ok_or_else(|| format!("id must be a string or number, got {}", value))
        }
    }
}

/// Represents a memo card.
///
/// Only `id` is required when reading. Fields the core does not interpret,
/// and known fields holding a value of an unexpected type, are kept in
/// `extra` so that a merge hands them back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Map<String, Value>")]
pub struct Note {
    /// Stable identity shared by every copy of the note
    pub id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<TimeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<TimeValue>,
    /// Legacy modification field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<TimeValue>,
    /// Legacy creation field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<TimeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<TimeValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlinks: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_clips: Option<Vec<Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TryFrom<Map<String, Value>> for Note {
    type Error = String;

    fn try_from(mut raw: Map<String, Value>) -> Result<Self, Self::Error> {
        let id = take_id(&mut raw)?;
        // Content is always text; other values keep their JSON spelling.
        let content = match raw.remove("content") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        };

        Ok(Self {
            id,
            content,
            created_at: take_field(&mut raw, "createdAt"),
            updated_at: take_field(&mut raw, "updatedAt"),
            last_modified: take_field(&mut raw, "lastModified"),
            timestamp: take_field(&mut raw, "timestamp"),
            is_pinned: take_field(&mut raw, "isPinned"),
            pinned_at: take_field(&mut raw, "pinnedAt"),
            tags: take_field(&mut raw, "tags"),
            backlinks: take_field(&mut raw, "backlinks"),
            audio_clips: take_field(&mut raw, "audioClips"),
            extra: raw,
        })
    }
}

impl Note {
    /// Create a new note with the given content
    pub fn new(content: String) -> Self {
        let now = TimeValue::now();
        Self {
            id: Uuid::now_v7().simple().to_string(),
            content,
            created_at: Some(now.clone()),
            updated_at: Some(now),
            last_modified: None,
            timestamp: None,
            is_pinned: None,
            pinned_at: None,
            tags: None,
            backlinks: None,
            audio_clips: None,
            extra: Map::new(),
        }
    }

    /// Get a timestamp field by name
    pub fn time_field(&self, field: TimestampField) -> Option<&TimeValue> {
        match field {
            CreatedAt => self.created_at.as_ref(),
            UpdatedAt => self.updated_at.as_ref(),
            LastModified => self.last_modified.as_ref(),
            Timestamp => self.timestamp.as_ref(),
            PinnedAt => self.pinned_at.as_ref(),
        }
    }

    /// Resolve a preference list: the first set field wins and is converted
    /// to epoch milliseconds (unparseable or absent gives 0).
    pub fn resolve_millis(&self, preference: &[TimestampField]) -> i64 {
        preference
            .iter()
            .filter_map(|field| self.time_field(*field))
            .find(|value| value.is_set())
            .map(TimeValue::to_millis)
            .unwrap_or(0)
    }

    /// Effective modification time used for last-writer-wins.
    pub fn effective_updated_at(&self) -> i64 {
        self.resolve_millis(UPDATE_TIME_PREFERENCE)
    }

    /// Whether the record itself claims to be pinned.
    ///
    /// A non-boolean `isPinned` counts by truthiness.
    pub fn pinned_flag(&self) -> bool {
        match self.is_pinned {
            Some(flag) => flag,
            None => self.extra.get("isPinned").map(is_truthy).unwrap_or(false),
        }
    }

    /// Set or clear both pin fields, dropping any raw copies of them
    pub fn set_pin(&mut self, pinned_at: Option<TimeValue>) {
        self.extra.remove("isPinned");
        self.extra.remove("pinnedAt");
        self.is_pinned = pinned_at.as_ref().map(|_| true);
        self.pinned_at = pinned_at;
    }

    /// Mark the note as modified now
    pub fn touch(&mut self) {
        self.extra.remove("updatedAt");
        self.updated_at = Some(TimeValue::now());
    }
}

/// Deletion marker for a note id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "Map<String, Value>")]
pub struct Tombstone {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<TimeValue>,
}

impl TryFrom<Map<String, Value>> for Tombstone {
    type Error = String;

    fn try_from(mut raw: Map<String, Value>) -> Result<Self, Self::Error> {
        Ok(Self {
            id: take_id(&mut raw)?,
            deleted_at: take_field(&mut raw, "deletedAt"),
        })
    }
}

impl Tombstone {
    /// Create a tombstone stamped with the current time
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted_at: Some(TimeValue::now()),
        }
    }

    /// Deletion time in epoch milliseconds (0 when absent)
    pub fn deleted_millis(&self) -> i64 {
        self.deleted_at
            .as_ref()
            .filter(|value| value.is_set())
            .map(TimeValue::to_millis)
            .unwrap_or(0)
    }
}

/// The note-bearing part of either side of a merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteSet {
    pub notes: Vec<Note>,
    pub pinned: Vec<Note>,
    pub tombstones: Vec<Tombstone>,
}

impl NoteSet {
    pub fn new(notes: Vec<Note>, pinned: Vec<Note>, tombstones: Vec<Tombstone>) -> Self {
        Self {
            notes,
            pinned,
            tombstones,
        }
    }

    /// True if neither list holds a note (tombstones are not counted)
    pub fn has_no_notes(&self) -> bool {
        self.notes.is_empty() && self.pinned.is_empty()
    }

    /// Find a note by id, pinned list first
    pub fn find(&self, id: &str) -> Option<&Note> {
        self.pinned
            .iter()
            .chain(self.notes.iter())
            .find(|note| note.id == id)
    }
}

/// Opaque settings sections carried through the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettingsBag(pub Map<String, Value>);

impl SettingsBag {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, section: SettingsSection) -> Option<&Value> {
        self.0.get(section.snapshot_field())
    }

    pub fn insert(&mut self, section: SettingsSection, value: Value) {
        self.0.insert(section.snapshot_field().to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Named configuration sections, each stored under its own local key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsSection {
    ThemeColor,
    DarkMode,
    Hitokoto,
    Font,
    Background,
    Avatar,
    Canvas,
    Music,
    KeyboardShortcuts,
}

impl SettingsSection {
    pub const ALL: [SettingsSection; 9] = [
        SettingsSection::ThemeColor,
        SettingsSection::DarkMode,
        SettingsSection::Hitokoto,
        SettingsSection::Font,
        SettingsSection::Background,
        SettingsSection::Avatar,
        SettingsSection::Canvas,
        SettingsSection::Music,
        SettingsSection::KeyboardShortcuts,
    ];

    /// Field name inside the snapshot's `settings` object
    pub fn snapshot_field(&self) -> &'static str {
        match self {
            SettingsSection::ThemeColor => "themeColor",
            SettingsSection::DarkMode => "darkMode",
            SettingsSection::Hitokoto => "hitokotoConfig",
            SettingsSection::Font => "fontConfig",
            SettingsSection::Background => "backgroundConfig",
            SettingsSection::Avatar => "avatarConfig",
            SettingsSection::Canvas => "canvasConfig",
            SettingsSection::Music => "musicConfig",
            SettingsSection::KeyboardShortcuts => "keyboardShortcuts",
        }
    }

    /// Key in the local store
    pub fn store_key(&self) -> &'static str {
        match self {
            SettingsSection::Canvas => "canvasState",
            other => other.snapshot_field(),
        }
    }

    pub fn from_snapshot_field(field: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|section| section.snapshot_field() == field)
    }

    /// Value used when the local store has nothing for this section
    pub fn default_value(&self) -> Value {
        match self {
            SettingsSection::ThemeColor => Value::String("#818CF8".to_string()),
            SettingsSection::DarkMode => Value::String("false".to_string()),
            SettingsSection::Hitokoto => serde_json::json!({
                "enabled": true,
                "types": ["a", "b", "c", "d", "i", "j", "k"]
            }),
            SettingsSection::Font => serde_json::json!({
                "selectedFont": "default",
                "fontSize": 16
            }),
            SettingsSection::Background => serde_json::json!({
                "imageUrl": "",
                "brightness": 50,
                "blur": 10,
                "useRandom": false
            }),
            SettingsSection::Avatar => serde_json::json!({ "imageUrl": "" }),
            SettingsSection::Canvas => Value::Null,
            SettingsSection::Music => serde_json::json!({
                "enabled": true,
                "customSongs": []
            }),
            SettingsSection::KeyboardShortcuts => serde_json::json!({
                "toggleSidebar": "Tab",
                "openAIDialog": "Ctrl+Space",
                "openSettings": "Ctrl+,",
                "toggleCanvasMode": "Ctrl+/",
                "openDailyReview": "Ctrl+\\"
            }),
        }
    }

    /// Whether a value pulled from a remote snapshot should overwrite the
    /// local section during restore. Dark mode and canvas state accept any
    /// present value; the rest require a non-empty one.
    pub fn accepts_restored(&self, value: &Value) -> bool {
        match self {
            SettingsSection::DarkMode | SettingsSection::Canvas => true,
            _ => is_truthy(value),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// The single JSON document stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,
    pub updated_at: String,
    pub memos: Vec<Note>,
    pub pinned_memos: Vec<Note>,
    pub settings: SettingsBag,
    pub deleted_memo_ids: Vec<Tombstone>,
}

impl Snapshot {
    /// Build a snapshot stamped with the current time
    pub fn new(notes: NoteSet, settings: SettingsBag) -> Self {
        Self {
            version: SNAPSHOT_VERSION.to_string(),
            updated_at: iso_from_millis(Utc::now().timestamp_millis()),
            memos: notes.notes,
            pinned_memos: notes.pinned,
            settings,
            deleted_memo_ids: notes.tombstones,
        }
    }

    /// Parse a snapshot without trusting its shape.
    ///
    /// Fields that are missing or not arrays are treated as empty; entries
    /// without a usable id are skipped.
    pub fn from_value_lenient(value: &Value) -> Self {
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let settings = match value.get("settings") {
            Some(Value::Object(map)) => SettingsBag(map.clone()),
            _ => SettingsBag::new(),
        };

        Self {
            version: text("version"),
            updated_at: text("updatedAt"),
            memos: parse_entries(value.get("memos"), "memos"),
            pinned_memos: parse_entries(value.get("pinnedMemos"), "pinnedMemos"),
            settings,
            deleted_memo_ids: parse_entries(value.get("deletedMemoIds"), "deletedMemoIds"),
        }
    }

    /// Notes, pinned notes and tombstones of this snapshot
    pub fn note_set(&self) -> NoteSet {
        NoteSet::new(
            self.memos.clone(),
            self.pinned_memos.clone(),
            self.deleted_memo_ids.clone(),
        )
    }
}

/// Parse a JSON array entry by entry, dropping entries that do not fit `T`.
pub fn parse_entries<T>(value: Option<&Value>, field: &str) -> Vec<T>
where
    T: for<'de> Deserialize<'de>,
{
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match T::deserialize(item) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::debug!(field = %field, error = %e, "Skipping malformed entry");
                None
            }
        })
        .collect()
}
