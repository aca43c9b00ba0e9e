//! Snapshot merge for multi-device sync.
//!
//! Resolves two note sets (this device and the remote snapshot) into one:
//! last-writer-wins per note id, monotone tombstones, and a pin flag that
//! sticks once observed on an equally recent copy. The result does not
//! depend on which side is passed first except for the local tie-break on
//! identical timestamps.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;

use crate::models::{
    Note, NoteSet, TimeValue, Tombstone, MEMO_SORT_PREFERENCE, PINNED_SORT_PREFERENCE,
    PIN_TIME_PREFERENCE,
};

/// Which side of the merge a copy came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A copy of a note competing for its id
#[derive(Debug, Clone)]
struct Candidate {
    note: Note,
    pinned: bool,
    /// Pin time in epoch ms; only known for copies from a pinned list
    pinned_at: i64,
    updated_at: i64,
    origin: Origin,
}

/// Merge local and remote note sets using the current time for any
/// timestamp the merge has to invent.
pub fn merge(local: &NoteSet, remote: &NoteSet) -> NoteSet {
    merge_at(local, remote, Utc::now().timestamp_millis())
}

/// Merge local and remote note sets.
///
/// `now_ms` stamps tombstones that carry no deletion time and pinned notes
/// with no usable pin time.
pub fn merge_at(local: &NoteSet, remote: &NoteSet, now_ms: i64) -> NoteSet {
    let tombstones = union_tombstones(&local.tombstones, &remote.tombstones, now_ms);
    let deletions: BTreeMap<&str, i64> = tombstones
        .iter()
        .map(|(id, t)| (id.as_str(), t.deleted_millis()))
        .collect();

    let mut winners: BTreeMap<String, Candidate> = BTreeMap::new();
    let sources = [
        (&local.notes, false, Origin::Local),
        (&local.pinned, true, Origin::Local),
        (&remote.notes, false, Origin::Remote),
        (&remote.pinned, true, Origin::Remote),
    ];
    for (list, from_pinned_list, origin) in sources {
        for note in list.iter() {
            ingest(&mut winners, &deletions, note, from_pinned_list, origin);
        }
    }

    // A tombstone only yields to a strictly newer edit
    winners.retain(|id, winner| !is_suppressed(&deletions, id, winner.updated_at));

    let mut notes = Vec::new();
    let mut pinned = Vec::new();
    for winner in winners.into_values() {
        let mut note = winner.note;
        if winner.pinned {
            let own_pin = note.pinned_at.as_ref().map(TimeValue::to_millis).unwrap_or(0);
            let pin_ms = [winner.pinned_at, own_pin, winner.updated_at]
                .into_iter()
                .find(|ms| *ms != 0)
                .unwrap_or(now_ms);
            note.set_pin(Some(TimeValue::from_millis(pin_ms)));
            pinned.push(note);
        } else {
            note.set_pin(None);
            notes.push(note);
        }
    }

    sort_newest_first(&mut notes, |n| n.resolve_millis(MEMO_SORT_PREFERENCE));
    sort_newest_first(&mut pinned, |n| n.resolve_millis(PINNED_SORT_PREFERENCE));

    tracing::debug!(
        notes = notes.len(),
        pinned = pinned.len(),
        tombstones = tombstones.len(),
        "Merged note sets"
    );

    NoteSet::new(notes, pinned, tombstones.into_values().collect())
}

/// Union of both tombstone lists, keeping the later deletion per id.
/// Returned in id order.
pub fn merge_tombstones(local: &[Tombstone], remote: &[Tombstone], now_ms: i64) -> Vec<Tombstone> {
    union_tombstones(local, remote, now_ms).into_values().collect()
}

fn union_tombstones(
    local: &[Tombstone],
    remote: &[Tombstone],
    now_ms: i64,
) -> BTreeMap<String, Tombstone> {
    let mut merged: BTreeMap<String, Tombstone> = BTreeMap::new();

    for tombstone in remote.iter().chain(local.iter()) {
        let replace = match merged.get(&tombstone.id) {
            Some(existing) => tombstone.deleted_millis() > existing.deleted_millis(),
            None => true,
        };
        if !replace {
            continue;
        }

        let mut stored = tombstone.clone();
        if !stored.deleted_at.as_ref().is_some_and(TimeValue::is_set) {
            stored.deleted_at = Some(TimeValue::from_millis(now_ms));
        }
        merged.insert(stored.id.clone(), stored);
    }

    merged
}

fn is_suppressed(deletions: &BTreeMap<&str, i64>, id: &str, updated_at: i64) -> bool {
    deletions
        .get(id)
        .is_some_and(|deleted_at| updated_at <= *deleted_at)
}

fn ingest(
    winners: &mut BTreeMap<String, Candidate>,
    deletions: &BTreeMap<&str, i64>,
    note: &Note,
    from_pinned_list: bool,
    origin: Origin,
) {
    let updated_at = note.effective_updated_at();
    if is_suppressed(deletions, &note.id, updated_at) {
        return;
    }

    let candidate = Candidate {
        note: note.clone(),
        pinned: from_pinned_list || note.pinned_flag(),
        pinned_at: if from_pinned_list {
            note.resolve_millis(PIN_TIME_PREFERENCE)
        } else {
            0
        },
        updated_at,
        origin,
    };

    match winners.get_mut(&note.id) {
        None => {
            winners.insert(note.id.clone(), candidate);
        }
        Some(winner) => {
            let newer = candidate.updated_at > winner.updated_at;
            let tie = candidate.updated_at == winner.updated_at;
            if newer || (tie && candidate.origin == Origin::Local) {
                *winner = candidate;
            } else if tie && candidate.pinned && !winner.pinned {
                winner.pinned = true;
                winner.pinned_at = winner.pinned_at.max(candidate.pinned_at);
            }
        }
    }
}

fn sort_newest_first(notes: &mut [Note], key: impl Fn(&Note) -> i64) {
    notes.sort_by(|a, b| match key(b).cmp(&key(a)) {
        Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    const NOW: i64 = 1_700_000_000_000;

    fn note(value: serde_json::Value) -> Note {
        serde_json::from_value(value).unwrap()
    }

    fn tombstone(id: &str, deleted_at: i64) -> Tombstone {
        serde_json::from_value(json!({"id": id, "deletedAt": deleted_at})).unwrap()
    }

    fn set(notes: Vec<Note>, pinned: Vec<Note>, tombstones: Vec<Tombstone>) -> NoteSet {
        NoteSet::new(notes, pinned, tombstones)
    }

    fn ids(notes: &[Note]) -> BTreeSet<String> {
        notes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn test_remote_newer_wins() {
        let local = set(vec![note(json!({"id": "1", "content": "a", "updatedAt": 100}))], vec![], vec![]);
        let remote = set(vec![note(json!({"id": "1", "content": "b", "updatedAt": 200}))], vec![], vec![]);

        let merged = merge_at(&local, &remote, NOW);
        assert_eq!(merged.notes.len(), 1);
        assert_eq!(merged.notes[0].content, "b");
    }

    #[test]
    fn test_local_tombstone_suppresses_remote_note() {
        let local = set(vec![], vec![], vec![tombstone("2", 150)]);
        let remote = set(vec![note(json!({"id": "2", "content": "x", "updatedAt": 100}))], vec![], vec![]);

        let merged = merge_at(&local, &remote, NOW);
        assert!(merged.notes.is_empty());
        assert!(merged.pinned.is_empty());
        assert_eq!(merged.tombstones, vec![tombstone("2", 150)]);
    }

    #[test]
    fn test_edit_after_delete_resurrects() {
        let local = set(vec![], vec![], vec![tombstone("3", 150)]);
        let remote = set(
            vec![note(json!({"id": "3", "content": "edited later", "updatedAt": 300}))],
            vec![],
            vec![],
        );

        let merged = merge_at(&local, &remote, NOW);
        assert_eq!(merged.notes.len(), 1);
        assert_eq!(merged.notes[0].content, "edited later");
        assert_eq!(merged.tombstones.len(), 1);
    }

    #[test]
    fn test_tombstone_wins_equal_time() {
        let local = set(vec![note(json!({"id": "4", "updatedAt": 150}))], vec![], vec![]);
        let remote = set(vec![], vec![], vec![tombstone("4", 150)]);

        let merged = merge_at(&local, &remote, NOW);
        assert!(merged.notes.is_empty());
    }

    #[test]
    fn test_local_wins_tie() {
        let local = set(vec![note(json!({"id": "1", "content": "mine", "updatedAt": 100}))], vec![], vec![]);
        let remote = set(vec![note(json!({"id": "1", "content": "theirs", "updatedAt": 100}))], vec![], vec![]);

        assert_eq!(merge_at(&local, &remote, NOW).notes[0].content, "mine");
        assert_eq!(merge_at(&remote, &local, NOW).notes[0].content, "theirs");
    }

    #[test]
    fn test_pin_is_sticky_on_tie() {
        let local = set(vec![note(json!({"id": "1", "content": "mine", "updatedAt": 100}))], vec![], vec![]);
        let remote = set(
            vec![],
            vec![note(json!({"id": "1", "content": "theirs", "updatedAt": 100, "pinnedAt": 90}))],
            vec![],
        );

        let merged = merge_at(&local, &remote, NOW);
        assert!(merged.notes.is_empty());
        assert_eq!(merged.pinned.len(), 1);
        assert_eq!(merged.pinned[0].content, "mine");
        assert_eq!(merged.pinned[0].is_pinned, Some(true));
        assert_eq!(merged.pinned[0].pinned_at, Some(TimeValue::from_millis(90)));
    }

    #[test]
    fn test_newer_unpinned_copy_unpins() {
        let local = set(vec![note(json!({"id": "1", "updatedAt": 200}))], vec![], vec![]);
        let remote = set(vec![], vec![note(json!({"id": "1", "updatedAt": 100, "pinnedAt": 100}))], vec![]);

        let merged = merge_at(&local, &remote, NOW);
        assert_eq!(merged.notes.len(), 1);
        assert!(merged.pinned.is_empty());
        assert_eq!(merged.notes[0].is_pinned, None);
        assert_eq!(merged.notes[0].pinned_at, None);
    }

    #[test]
    fn test_is_pinned_flag_in_regular_list() {
        let local = set(
            vec![note(json!({"id": "1", "updatedAt": 100, "isPinned": true}))],
            vec![],
            vec![],
        );

        let merged = merge_at(&local, &NoteSet::default(), NOW);
        assert_eq!(merged.pinned.len(), 1);
        // No pin time recorded: falls back to the update time
        assert_eq!(merged.pinned[0].pinned_at, Some(TimeValue::from_millis(100)));
    }

    #[test]
    fn test_loose_pin_flag_is_normalized() {
        let local = set(
            vec![note(json!({"id": "1", "updatedAt": 100, "isPinned": "yes", "pinnedAt": {}}))],
            vec![],
            vec![],
        );

        let merged = merge_at(&local, &NoteSet::default(), NOW);
        assert_eq!(merged.pinned.len(), 1);
        let value = serde_json::to_value(&merged.pinned[0]).unwrap();
        assert_eq!(value["isPinned"], json!(true));
        assert_eq!(value["pinnedAt"], serde_json::to_value(TimeValue::from_millis(100)).unwrap());
    }

    #[test]
    fn test_pinned_without_any_time_uses_merge_time() {
        let local = set(vec![], vec![note(json!({"id": "1"}))], vec![]);
        let merged = merge_at(&local, &NoteSet::default(), NOW);
        assert_eq!(merged.pinned[0].pinned_at, Some(TimeValue::from_millis(NOW)));
    }

    #[test]
    fn test_partition_has_no_duplicates() {
        let local = set(
            vec![note(json!({"id": "1", "updatedAt": 100})), note(json!({"id": "2", "updatedAt": 100}))],
            vec![note(json!({"id": "1", "updatedAt": 100}))],
            vec![],
        );
        let remote = set(
            vec![note(json!({"id": "2", "updatedAt": 50}))],
            vec![note(json!({"id": "2", "updatedAt": 50}))],
            vec![],
        );

        let merged = merge_at(&local, &remote, NOW);
        assert!(ids(&merged.notes).is_disjoint(&ids(&merged.pinned)));
        assert_eq!(ids(&merged.pinned), BTreeSet::from(["1".to_string()]));
        assert_eq!(ids(&merged.notes), BTreeSet::from(["2".to_string()]));
    }

    #[test]
    fn test_tombstone_union_keeps_latest() {
        let local = [tombstone("1", 100), tombstone("2", 500)];
        let remote = [tombstone("1", 300), tombstone("2", 200), tombstone("3", 50)];

        let merged = merge_tombstones(&local, &remote, NOW);
        let times: Vec<(String, i64)> = merged
            .iter()
            .map(|t| (t.id.clone(), t.deleted_millis()))
            .collect();
        assert_eq!(
            times,
            vec![
                ("1".to_string(), 300),
                ("2".to_string(), 500),
                ("3".to_string(), 50)
            ]
        );
    }

    #[test]
    fn test_tombstone_without_time_is_stamped() {
        let undated: Tombstone = serde_json::from_value(json!({"id": "9"})).unwrap();
        let merged = merge_tombstones(&[undated], &[], NOW);
        assert_eq!(merged[0].deleted_millis(), NOW);
    }

    #[test]
    fn test_memos_sorted_by_creation_newest_first() {
        let local = set(
            vec![
                note(json!({"id": "old", "createdAt": 100, "updatedAt": 900})),
                note(json!({"id": "new", "createdAt": 300})),
                note(json!({"id": "legacy", "timestamp": 200})),
                note(json!({"id": "a-tie", "createdAt": 300})),
            ],
            vec![],
            vec![],
        );

        let merged = merge_at(&local, &NoteSet::default(), NOW);
        let order: Vec<&str> = merged.notes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(order, vec!["a-tie", "new", "legacy", "old"]);
    }

    #[test]
    fn test_pinned_sorted_by_pin_time() {
        let local = set(
            vec![],
            vec![
                note(json!({"id": "1", "updatedAt": 100, "pinnedAt": 500})),
                note(json!({"id": "2", "updatedAt": 100, "pinnedAt": 900})),
            ],
            vec![],
        );

        let merged = merge_at(&local, &NoteSet::default(), NOW);
        assert_eq!(merged.pinned[0].id, "2");
        assert_eq!(merged.pinned[1].id, "1");
    }

    #[test]
    fn test_unknown_fields_survive_merge() {
        let remote = set(
            vec![note(json!({"id": "1", "updatedAt": 1, "color": "red", "tags": ["x"]}))],
            vec![],
            vec![],
        );

        let merged = merge_at(&NoteSet::default(), &remote, NOW);
        assert_eq!(merged.notes[0].extra.get("color"), Some(&json!("red")));
        assert_eq!(merged.notes[0].tags, Some(vec!["x".to_string()]));
    }

    fn scenario() -> (NoteSet, NoteSet) {
        let local = set(
            vec![
                note(json!({"id": "1", "content": "a", "updatedAt": 100})),
                note(json!({"id": "2", "content": "b", "updatedAt": 400})),
                note(json!({"id": "5", "content": "e", "updatedAt": 100})),
            ],
            vec![note(json!({"id": "3", "content": "c", "updatedAt": 120, "pinnedAt": 130}))],
            vec![tombstone("4", 250)],
        );
        let remote = set(
            vec![
                note(json!({"id": "1", "content": "a2", "updatedAt": 200})),
                note(json!({"id": "4", "content": "d", "updatedAt": 200})),
                note(json!({"id": "6", "content": "f", "createdAt": "2024-01-01T00:00:00.000Z"})),
            ],
            vec![note(json!({"id": "2", "content": "b-old", "updatedAt": 300, "pinnedAt": 310}))],
            vec![tombstone("5", 150), tombstone("7", 10)],
        );
        (local, remote)
    }

    #[test]
    fn test_merge_converges_regardless_of_order() {
        let (local, remote) = scenario();
        let ab = merge_at(&local, &remote, NOW);
        let ba = merge_at(&remote, &local, NOW);

        assert_eq!(ids(&ab.notes), ids(&ba.notes));
        assert_eq!(ids(&ab.pinned), ids(&ba.pinned));
        assert_eq!(ab.tombstones, ba.tombstones);
        assert_eq!(ids(&ab.notes), BTreeSet::from(["1".to_string(), "2".to_string(), "6".to_string()]));
        assert_eq!(ids(&ab.pinned), BTreeSet::from(["3".to_string()]));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (local, remote) = scenario();
        let once = merge_at(&local, &remote, NOW);
        let twice = merge_at(&once, &once, NOW);
        assert_eq!(once, twice);

        let again = merge_at(&once, &remote, NOW);
        assert_eq!(ids(&again.notes), ids(&once.notes));
        assert_eq!(ids(&again.pinned), ids(&once.pinned));
    }

    #[test]
    fn test_empty_inputs() {
        let merged = merge(&NoteSet::default(), &NoteSet::default());
        assert!(merged.has_no_notes());
        assert!(merged.tombstones.is_empty());
    }
}
