//! Integration tests for the in-memory session store.
//!
//! Expiry is driven with paused Tokio time so the tests never sleep.

use std::time::Duration;

use feast_protocol::{Phase, PlayerId, RoomCode, RoomId, SessionId};
use feast_session::{
    MemoryStore, PlateData, PlayerData, RoomData, SessionRecord, SessionStore, StateData,
    StoreConfig,
};

// =========================================================================
// Helpers
// =========================================================================

fn room(id: &str, code: &str) -> RoomData {
    let session = SessionId::new("s-host");
    RoomData {
        id: RoomId::new(id),
        code: RoomCode::parse(code).unwrap(),
        plate_count: 4,
        players: [
            Some(PlayerData {
                id: PlayerId::for_session(&session),
                nickname: "host".into(),
                session_id: session,
                tokens: 5,
            }),
            None,
        ],
        state: StateData {
            phase: Phase::Placement,
            current_turn: 0,
            placement_round: 1,
            max_round: 1,
            time_left: 0,
            plates: vec![PlateData::default(); 4],
            selected_plates: vec![],
            matched_plates: vec![],
        },
        created_at: 1_700_000_000,
    }
}

fn short_ttl() -> StoreConfig {
    StoreConfig {
        room_ttl: Duration::from_secs(100),
        session_ttl: Duration::from_secs(10),
    }
}

// =========================================================================
// Rooms
// =========================================================================

#[tokio::test]
async fn test_save_room_then_get_by_id_and_code() {
    let store = MemoryStore::default();
    let data = room("r1", "ABCDEF");
    store.save_room(&data).await.unwrap();

    assert_eq!(store.get_room(&RoomId::new("r1")).await.unwrap(), Some(data.clone()));
    let by_code = store
        .get_room_by_code(&RoomCode::parse("abcdef").unwrap())
        .await
        .unwrap();
    assert_eq!(by_code, Some(data));
}

#[tokio::test]
async fn test_delete_room_removes_code_index() {
    let store = MemoryStore::default();
    store.save_room(&room("r1", "ABCDEF")).await.unwrap();
    store.delete_room(&RoomId::new("r1")).await.unwrap();

    assert!(store.get_room(&RoomId::new("r1")).await.unwrap().is_none());
    assert!(store
        .get_room_by_code(&RoomCode::parse("ABCDEF").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_delete_room_keeps_code_reused_by_newer_room() {
    let store = MemoryStore::default();
    store.save_room(&room("old", "ABCDEF")).await.unwrap();
    store.save_room(&room("new", "ABCDEF")).await.unwrap();
    store.delete_room(&RoomId::new("old")).await.unwrap();

    let found = store
        .get_room_by_code(&RoomCode::parse("ABCDEF").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, RoomId::new("new"));
}

#[tokio::test(start_paused = true)]
async fn test_room_expires_after_ttl() {
    let store = MemoryStore::new(short_ttl());
    store.save_room(&room("r1", "ABCDEF")).await.unwrap();

    tokio::time::advance(Duration::from_secs(99)).await;
    assert!(store.get_room(&RoomId::new("r1")).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(store.get_room(&RoomId::new("r1")).await.unwrap().is_none());
}

// =========================================================================
// Sessions
// =========================================================================

#[tokio::test]
async fn test_session_round_trip_and_delete() {
    let store = MemoryStore::default();
    let sid = SessionId::new("s1");
    store.save_session(&sid, &RoomId::new("r1"), 1).await.unwrap();

    assert_eq!(
        store.get_session(&sid).await.unwrap(),
        Some(SessionRecord { room_id: RoomId::new("r1"), player_index: 1 })
    );

    store.delete_session(&sid).await.unwrap();
    assert!(store.get_session(&sid).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_purge_expired_drops_sessions_before_rooms() {
    let store = MemoryStore::new(short_ttl());
    store.save_room(&room("r1", "ABCDEF")).await.unwrap();
    store
        .save_session(&SessionId::new("s1"), &RoomId::new("r1"), 0)
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.purge_expired(), 1);
    assert!(store.get_session(&SessionId::new("s1")).await.unwrap().is_none());
    assert!(store.get_room(&RoomId::new("r1")).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(100)).await;
    assert_eq!(store.purge_expired(), 1);
}

#[test]
fn test_room_data_json_uses_camel_case() {
    let value = serde_json::to_value(room("r1", "ABCDEF")).unwrap();
    assert_eq!(value["plateCount"], 4);
    assert_eq!(value["players"][0]["sessionId"], "s-host");
    assert!(value["players"][1].is_null());
    assert_eq!(value["state"]["phase"], "placement");
    assert_eq!(value["state"]["plates"][0]["hasTokens"], false);
}
