//! Change notifications.
//!
//! Every mutation of local state publishes a `ChangeEvent` naming the part
//! that changed. The sync scheduler subscribes and treats any event as a
//! reason to schedule a cycle; UI layers can subscribe to refresh views.

use tokio::sync::broadcast;

use crate::models::SettingsSection;

/// Capacity of the broadcast channel. Slow subscribers that fall further
/// behind see `Lagged` and skip ahead.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which part of local state changed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangePart {
    /// Regular note list edited by the user
    Memo,
    /// Pinned note list edited by the user
    Pinned,
    /// A settings section was saved
    Settings(SettingsSection),
    /// Sync cycle rewrote the regular note list
    SyncMemos,
    /// Sync cycle rewrote the pinned note list
    SyncPinned,
    /// Local state was hydrated from the remote snapshot
    RestoreRemote,
    /// Remote storage settings changed
    S3Config,
    /// Anything else; still a sync trigger
    Other(String),
}

impl ChangePart {
    pub fn as_str(&self) -> String {
        match self {
            ChangePart::Memo => "memo".to_string(),
            ChangePart::Pinned => "pinned".to_string(),
            ChangePart::Settings(section) => format!("settings.{}", section.snapshot_field()),
            ChangePart::SyncMemos => "sync.memos".to_string(),
            ChangePart::SyncPinned => "sync.pinned".to_string(),
            ChangePart::RestoreRemote => "restore.s3".to_string(),
            ChangePart::S3Config => "s3".to_string(),
            ChangePart::Other(part) => part.clone(),
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "memo" => ChangePart::Memo,
            "pinned" => ChangePart::Pinned,
            "sync.memos" => ChangePart::SyncMemos,
            "sync.pinned" => ChangePart::SyncPinned,
            "restore.s3" => ChangePart::RestoreRemote,
            "s3" => ChangePart::S3Config,
            other => other
                .strip_prefix("settings.")
                .and_then(SettingsSection::from_snapshot_field)
                .map(ChangePart::Settings)
                .unwrap_or_else(|| ChangePart::Other(other.to_string())),
        }
    }

    /// Whether the change was written by a sync cycle or restore
    pub fn is_sync_originated(&self) -> bool {
        matches!(
            self,
            ChangePart::SyncMemos | ChangePart::SyncPinned | ChangePart::RestoreRemote
        )
    }
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub part: ChangePart,
}

impl ChangeEvent {
    pub fn new(part: ChangePart) -> Self {
        Self { part }
    }
}

/// Publish/subscribe channel for change events.
///
/// Cloning the bus yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish a change. Having no subscribers is not an error.
    pub fn publish(&self, part: ChangePart) {
        tracing::debug!(part = %part.as_str(), "Publishing change event");
        // Err only means nobody is listening right now
        let _ = self.sender.send(ChangeEvent::new(part));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_part_names() {
        assert_eq!(ChangePart::Memo.as_str(), "memo");
        assert_eq!(ChangePart::RestoreRemote.as_str(), "restore.s3");
        assert_eq!(
            ChangePart::Settings(SettingsSection::Font).as_str(),
            "settings.fontConfig"
        );
    }

    #[test]
    fn test_change_part_parsing() {
        assert_eq!(ChangePart::from_str("sync.pinned"), ChangePart::SyncPinned);
        assert_eq!(
            ChangePart::from_str("settings.darkMode"),
            ChangePart::Settings(SettingsSection::DarkMode)
        );
        assert_eq!(
            ChangePart::from_str("settings.unknown"),
            ChangePart::Other("settings.unknown".to_string())
        );
        assert_eq!(ChangePart::from_str("s3"), ChangePart::S3Config);
    }

    #[test]
    fn test_sync_originated() {
        assert!(ChangePart::SyncMemos.is_sync_originated());
        assert!(!ChangePart::Memo.is_sync_originated());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(ChangePart::Memo);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let other = bus.clone();

        other.publish(ChangePart::Pinned);
        bus.publish(ChangePart::S3Config);

        assert_eq!(rx.recv().await.unwrap().part, ChangePart::Pinned);
        assert_eq!(rx.recv().await.unwrap().part, ChangePart::S3Config);
    }
}
