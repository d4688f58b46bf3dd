use inline_types::{ChatId, MessageId, SpaceId, UserId};
use std::collections::HashSet;
use std::str::FromStr;

// ── Construction ─────────────────────────────────────────────────

#[test]
fn new_and_get_roundtrip() {
    let id = ChatId::new(42);
    assert_eq!(id.get(), 42);
}

#[test]
fn from_i64() {
    let id: SpaceId = 7.into();
    assert_eq!(id, SpaceId::new(7));
}

#[test]
fn display_is_raw_number() {
    assert_eq!(UserId::new(1001).to_string(), "1001");
}

#[test]
fn from_str_trims_whitespace() {
    let id = MessageId::from_str(" 99 ").unwrap();
    assert_eq!(id.get(), 99);
}

#[test]
fn from_str_invalid() {
    assert!(ChatId::from_str("not-a-number").is_err());
}

// ── Traits ───────────────────────────────────────────────────────

#[test]
fn ordering_follows_raw_value() {
    assert!(MessageId::new(1) < MessageId::new(2));
}

#[test]
fn hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(ChatId::new(5));
    set.insert(ChatId::new(5));
    assert_eq!(set.len(), 1);
}

#[test]
fn serializes_transparently() {
    let json = serde_json::to_string(&ChatId::new(12)).unwrap();
    assert_eq!(json, "12");
    let parsed: ChatId = serde_json::from_str("12").unwrap();
    assert_eq!(parsed, ChatId::new(12));
}
