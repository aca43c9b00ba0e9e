//! MemoCore - offline-first storage and cloud sync for the Memo note app.
//!
//! This library provides the core functionality for Memo:
//! - Data models (Note, Tombstone, Snapshot, settings sections)
//! - Local key-value store (SQLite)
//! - Snapshot merge (last-writer-wins with tombstones and sticky pins)
//! - Sync client and debounced, rate-limited sync scheduler
//! - Change events
//! - Configuration management
//!
//! # Feature Flags
//!
//! - `desktop`: Default config directory detection.
//! - `s3`: S3-compatible remote snapshot storage (AWS S3, Cloudflare R2, MinIO).

pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod merge;
pub mod models;
pub mod notebook;
pub mod remote;
#[cfg(feature = "s3")]
pub mod remote_s3;
pub mod scheduler;
pub mod sync_client;
pub mod validation;

// Re-export commonly used types
pub use config::Config;
pub use database::Database;
pub use error::{MemoError, MemoResult, ValidationError};
pub use events::{ChangeEvent, ChangePart, EventBus};
pub use merge::merge;
pub use models::{Note, NoteSet, SettingsSection, Snapshot, Tombstone};
pub use notebook::Notebook;
pub use remote::{MemoryRemoteStore, RemoteError, RemoteStore};
pub use scheduler::{ManualSyncResult, StartupAction, SyncScheduler};
pub use sync_client::{SyncClient, SyncResult};

#[cfg(feature = "s3")]
pub use remote_s3::{S3Config, S3RemoteStore};
