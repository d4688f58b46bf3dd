use inline_sync::codec::{self, MAX_FRAME_SIZE};
use inline_sync::protocol::{
    ClientBody, ClientMessage, ConnectionErrorKind, GetUpdatesKind, MESSAGE_ID_EPOCH_SECS,
    MessageIdGenerator, RpcCall, RpcResult, ServerBody, ServerPush,
};
use inline_sync::{HandshakeError, SyncError};
use inline_types::{Bucket, ChatId, UnixTime, UpdatePayload};
use pretty_assertions::assert_eq;
use serde_json::json;

// ── Message ids ──────────────────────────────────────────────────

#[test]
fn message_ids_pack_timestamp_and_sequence() {
    let mut ids = MessageIdGenerator::new();
    let at = MESSAGE_ID_EPOCH_SECS + 10;

    assert_eq!(ids.next_id_at(at), 10 << 32);
    assert_eq!(ids.next_id_at(at), (10 << 32) | 1);
    assert_eq!(ids.next_id_at(at), (10 << 32) | 2);
    assert_eq!(ids.next_id_at(at + 1), 11 << 32);
}

#[test]
fn message_ids_before_epoch_clamp_to_zero() {
    let mut ids = MessageIdGenerator::new();
    assert_eq!(ids.next_id_at(0), 1);
    assert_eq!(ids.next_id_at(MESSAGE_ID_EPOCH_SECS - 5), 2);
}

#[test]
fn live_message_ids_increase() {
    let mut ids = MessageIdGenerator::new();
    let first = ids.next_id();
    let second = ids.next_id();
    assert!(second > first);
}

// ── Envelopes ────────────────────────────────────────────────────

#[test]
fn get_updates_call_wire_shape() {
    let message = ClientMessage {
        id: 5,
        seq: 1,
        body: ClientBody::RpcCall {
            call: RpcCall::GetUpdates {
                bucket: Bucket::Chat(ChatId::new(7)),
                start_seq: 3,
                seq_end: None,
                limit: 50,
            },
        },
    };

    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(
        value,
        json!({
            "id": 5,
            "seq": 1,
            "body": {
                "type": "rpc_call",
                "call": {
                    "method": "get_updates",
                    "bucket": { "type": "chat", "id": 7 },
                    "start_seq": 3,
                    "seq_end": null,
                    "limit": 50
                }
            }
        })
    );
}

#[test]
fn connection_init_wire_shape() {
    let message = ClientMessage {
        id: 1,
        seq: 1,
        body: ClientBody::ConnectionInit {
            token: "secret".into(),
            layer: 1,
            client_version: "0.1.0".into(),
        },
    };
    let value = serde_json::to_value(&message).unwrap();
    assert_eq!(value["body"]["type"], "connection_init");
    assert_eq!(value["body"]["token"], "secret");
    assert_eq!(value["body"]["layer"], 1);
}

#[test]
fn decodes_too_long_get_updates_result() {
    let bytes = serde_json::to_vec(&json!({
        "id": 2,
        "body": {
            "type": "rpc_result",
            "req_msg_id": 9,
            "result": {
                "method": "get_updates",
                "result_kind": "too_long",
                "seq_end": 20,
                "server_seq": 40,
                "server_date": 1_700_000_000,
                "final": false
            }
        }
    }))
    .unwrap();

    let message = codec::decode_server(&bytes).unwrap();
    let ServerBody::RpcResult { req_msg_id, result } = message.body else {
        panic!("expected rpc result");
    };
    assert_eq!(req_msg_id, 9);
    let RpcResult::GetUpdates(result) = result else {
        panic!("expected getUpdates result");
    };
    assert_eq!(result.result_kind, GetUpdatesKind::TooLong);
    assert_eq!(result.seq_end, Some(20));
    assert_eq!(result.server_seq, 40);
    assert_eq!(result.server_date, UnixTime::from_secs(1_700_000_000));
    assert!(!result.is_final);
    assert!(result.updates.is_empty());
}

#[test]
fn decodes_pushed_updates_with_unknown_kinds() {
    let bytes = serde_json::to_vec(&json!({
        "id": 3,
        "body": {
            "type": "message",
            "push": {
                "kind": "updates",
                "updates": [
                    { "payload": { "kind": "chat_has_new_updates", "chat_id": 4, "update_seq": 12 } },
                    { "seq": 2, "date": 5, "payload": { "kind": "typing_started", "user_id": 1 } }
                ]
            }
        }
    }))
    .unwrap();

    let message = codec::decode_server(&bytes).unwrap();
    let ServerBody::Message {
        push: ServerPush::Updates { updates },
    } = message.body
    else {
        panic!("expected pushed updates");
    };
    assert_eq!(
        updates[0].bucket_notice(),
        Some((Bucket::Chat(ChatId::new(4)), 12))
    );
    assert_eq!(updates[1].payload, UpdatePayload::Unknown);
    assert!(!updates[1].is_supported());
}

#[test]
fn unknown_connection_error_kind_decodes_as_other() {
    let bytes = br#"{"id":1,"body":{"type":"connection_error","kind":"banned"}}"#;
    let message = codec::decode_server(bytes).unwrap();
    assert_eq!(
        message.body,
        ServerBody::ConnectionError {
            kind: ConnectionErrorKind::Other,
            message: String::new(),
        }
    );
}

#[test]
fn oversized_frames_are_rejected() {
    let frame = vec![b' '; MAX_FRAME_SIZE + 1];
    assert!(matches!(
        codec::decode_server(&frame),
        Err(SyncError::Transport(_))
    ));
    assert!(matches!(
        codec::decode_client(&frame),
        Err(SyncError::Transport(_))
    ));
}

#[test]
fn garbage_frames_are_serialization_errors() {
    assert!(matches!(
        codec::decode_server(b"not json"),
        Err(SyncError::Serialization(_))
    ));
}

#[test]
fn rpc_call_method_names() {
    let state = RpcCall::GetUpdatesState {
        date: UnixTime::EPOCH,
    };
    let updates = RpcCall::GetUpdates {
        bucket: Bucket::Chat(ChatId::new(1)),
        start_seq: 0,
        seq_end: Some(10),
        limit: 5,
    };
    assert_eq!(state.method(), "getUpdatesState");
    assert_eq!(updates.method(), "getUpdates");
}

// ── Errors ───────────────────────────────────────────────────────

#[test]
fn rpc_errors_get_friendly_labels() {
    assert_eq!(
        SyncError::rpc(429, 3, "slow down").to_string(),
        "Rate limited: slow down (HTTP 429)"
    );
    assert_eq!(SyncError::rpc(0, 1, "bad request").to_string(), "Bad request");
    assert_eq!(SyncError::rpc(0, 99, "").to_string(), "Unknown RPC error");
}

#[test]
fn error_recoverability() {
    assert!(SyncError::Transport("reset".into()).is_recoverable());
    assert!(SyncError::RpcTimeout.is_recoverable());
    assert!(!SyncError::ProtocolViolation("slice".into()).is_recoverable());
}

#[test]
fn credential_failures_are_flagged() {
    assert!(HandshakeError::AuthRejected("expired".into()).is_credential_failure());
    assert!(HandshakeError::MissingCredentials.is_credential_failure());
    assert!(!HandshakeError::Timeout.is_credential_failure());
    assert!(!HandshakeError::ProtocolMismatch("layer 2".into()).is_credential_failure());
}
