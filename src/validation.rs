//! Input validation for Memo.
//!
//! This module provides validation functions for user inputs.
//! All validators return MemoError::Validation on failure.

use crate::error::{MemoError, MemoResult};

pub const MAX_NOTE_ID_LENGTH: usize = 128;
pub const MAX_NOTE_CONTENT_LENGTH: usize = 1_000_000;
pub const MAX_OBJECT_KEY_LENGTH: usize = 1024;

/// Validate a note id.
///
/// Ids are opaque strings (UUID7 hex for new notes, epoch-millisecond
/// numbers for notes created by older clients) but must be non-empty and
/// printable.
pub fn validate_note_id(id: &str) -> MemoResult<()> {
    if id.trim().is_empty() {
        return Err(MemoError::validation("note_id", "cannot be empty"));
    }
    if id.len() > MAX_NOTE_ID_LENGTH {
        return Err(MemoError::validation(
            "note_id",
            format!("exceeds maximum length of {} characters", MAX_NOTE_ID_LENGTH),
        ));
    }
    if id.chars().any(char::is_control) {
        return Err(MemoError::validation(
            "note_id",
            "cannot contain control characters",
        ));
    }
    Ok(())
}

/// Validate note content length
pub fn validate_note_content(content: &str) -> MemoResult<()> {
    if content.len() > MAX_NOTE_CONTENT_LENGTH {
        return Err(MemoError::validation(
            "content",
            format!(
                "exceeds maximum length of {} bytes (got {})",
                MAX_NOTE_CONTENT_LENGTH,
                content.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a remote object key
pub fn validate_object_key(key: &str) -> MemoResult<()> {
    if key.trim().is_empty() {
        return Err(MemoError::validation("object_key", "cannot be empty"));
    }
    if key.starts_with('/') {
        return Err(MemoError::validation(
            "object_key",
            "must be relative (no leading '/')",
        ));
    }
    if key.len() > MAX_OBJECT_KEY_LENGTH {
        return Err(MemoError::validation(
            "object_key",
            format!("exceeds maximum length of {} bytes", MAX_OBJECT_KEY_LENGTH),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_note_id() {
        assert!(validate_note_id("0190a1b2c3d47e8f9a0b1c2d3e4f5a6b").is_ok());
        assert!(validate_note_id("1700000000000").is_ok());
        assert!(validate_note_id("").is_err());
        assert!(validate_note_id("   ").is_err());
        assert!(validate_note_id("a\nb").is_err());
        assert!(validate_note_id(&"x".repeat(MAX_NOTE_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_note_content() {
        assert!(validate_note_content("").is_ok());
        assert!(validate_note_content("Hello").is_ok());
        assert!(validate_note_content(&"x".repeat(MAX_NOTE_CONTENT_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_object_key() {
        assert!(validate_object_key("meow-app/app-data.json").is_ok());
        assert!(validate_object_key("").is_err());
        assert!(validate_object_key("/app-data.json").is_err());
    }
}
