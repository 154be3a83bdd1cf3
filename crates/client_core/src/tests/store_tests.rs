use super::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use shared::domain::{ConversationId, MessageId, UserId};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn durable(id: &str, sender: &str, content: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: MessageId::new(id),
        conversation_id: ConversationId::new("c1"),
        sender_id: UserId::new(sender),
        content: content.to_string(),
        reply_to_id: None,
        attachments: Vec::new(),
        created_at: at,
        edited_at: None,
        is_provisional: false,
    }
}

fn provisional(sender: &str, content: &str) -> Message {
    Message::provisional(
        ConversationId::new("c1"),
        UserId::new(sender),
        content,
        Vec::new(),
        None,
    )
}

fn ids(store: &MessageStore) -> Vec<String> {
    store.iter().map(|m| m.id.0.clone()).collect()
}

#[test]
fn snapshot_is_sorted_by_created_at() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m2", "alice", "second", t0() + Duration::seconds(10))));
    assert!(store.insert(durable("m1", "bob", "first", t0())));
    assert!(store.insert(durable("m3", "alice", "third", t0() + Duration::seconds(20))));

    assert_eq!(ids(&store), vec!["m1", "m2", "m3"]);
}

#[test]
fn equal_timestamps_keep_insertion_order() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("ma", "alice", "a", t0())));
    assert!(store.insert(durable("mb", "bob", "b", t0())));
    assert!(store.insert(durable("mc", "carol", "c", t0())));

    assert_eq!(ids(&store), vec!["ma", "mb", "mc"]);
}

#[test]
fn duplicate_durable_id_is_rejected() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m1", "alice", "hello", t0())));
    assert!(!store.insert(durable("m1", "alice", "hello again", t0())));

    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&MessageId::new("m1")).unwrap().content, "hello");
}

#[test]
fn upsert_by_id_noops_on_existing_entry() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m1", "alice", "hello", t0())));
    assert!(!store.upsert_by_id(durable("m1", "alice", "changed", t0())));
    assert!(store.upsert_by_id(durable("m2", "bob", "new", t0())));
    assert_eq!(store.len(), 2);
}

#[test]
fn remove_tolerates_absence() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m1", "alice", "hello", t0())));
    assert!(store.remove(&MessageId::new("m1")));
    assert!(!store.remove(&MessageId::new("m1")));
    assert!(store.is_empty());
}

#[test]
fn provisional_insert_claims_its_slot() {
    let mut store = MessageStore::new();
    let first = provisional("alice", "ok");
    let key = ProvisionalKey::of(&first);
    assert!(store.insert(first));

    assert!(store.provisional_matching(&key).is_some());
    // Same (sender, content, attachments) while the first still awaits
    // confirmation: rejected.
    assert!(!store.insert(provisional("alice", "ok")));
    assert_eq!(store.len(), 1);
}

#[test]
fn replace_confirms_provisional_and_clears_index() {
    let mut store = MessageStore::new();
    let pending = provisional("alice", "hello");
    let pending_id = pending.id.clone();
    let key = ProvisionalKey::of(&pending);
    assert!(store.insert(pending));

    let confirmed = durable("m1", "alice", "hello", t0());
    assert!(store.replace(&pending_id, confirmed));

    assert!(store.provisional_matching(&key).is_none());
    assert!(!store.has_provisional());
    let entry = store.get(&MessageId::new("m1")).unwrap();
    assert!(!entry.is_provisional);
    assert_eq!(entry.created_at, t0());
    // The slot is free again for a later identical message.
    assert!(store.insert(provisional("alice", "hello")));
}

#[test]
fn replace_repositions_by_new_timestamp() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m1", "bob", "first", t0())));
    let pending = provisional("alice", "hello");
    let pending_id = pending.id.clone();
    assert!(store.insert(pending));

    // Authoritative timestamp predates the existing entry; the confirmed
    // message must move ahead of it.
    let confirmed = durable("m2", "alice", "hello", t0() - Duration::seconds(5));
    assert!(store.replace(&pending_id, confirmed));

    assert_eq!(ids(&store), vec!["m2", "m1"]);
}

#[test]
fn remove_of_provisional_clears_index() {
    let mut store = MessageStore::new();
    let pending = provisional("alice", "hello");
    let pending_id = pending.id.clone();
    let key = ProvisionalKey::of(&pending);
    assert!(store.insert(pending));

    assert!(store.remove(&pending_id));
    assert!(store.provisional_matching(&key).is_none());
}

#[test]
fn update_fields_resorts_only_on_created_at_change() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m1", "alice", "first", t0())));
    assert!(store.insert(durable("m2", "bob", "second", t0() + Duration::seconds(10))));

    let edited_at = Some(t0() + Duration::seconds(30));
    assert!(store.update_fields(&MessageId::new("m2"), "second (edited)", edited_at, None));
    assert_eq!(ids(&store), vec!["m1", "m2"]);

    // An earlier authoritative created_at moves the entry.
    assert!(store.update_fields(
        &MessageId::new("m2"),
        "second (edited)",
        edited_at,
        Some(t0() - Duration::seconds(1)),
    ));
    assert_eq!(ids(&store), vec!["m2", "m1"]);
}

#[test]
fn update_fields_reports_no_change_for_identical_values() {
    let mut store = MessageStore::new();
    assert!(store.insert(durable("m1", "alice", "hello", t0())));
    assert!(!store.update_fields(&MessageId::new("m1"), "hello", None, Some(t0())));
    assert!(!store.update_fields(&MessageId::new("missing"), "x", None, None));
}
