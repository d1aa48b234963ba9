// JSON encoding of `SyncMessage`.
//
// Connections carry opaque byte payloads; this module is the only place that
// turns them into messages and back. Decoding is strict about shape (unknown
// `type` tags and missing fields are errors) so callers can drop anything
// they don't understand instead of applying half a message.

use thiserror::Error;

use crate::message::SyncMessage;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed sync message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("could not encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode(message: &SyncMessage) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|source| CodecError::Encode {
        kind: message.kind(),
        source,
    })
}

pub fn decode(payload: &[u8]) -> Result<SyncMessage, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Malformed)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::message::{BoardState, ChatMessage};
    use crate::types::{EntityId, Team};
    use crate::unit::{Unit, UnitPatch};

    #[test]
    fn tags_use_screaming_snake_case() {
        let bytes = encode(&SyncMessage::DpUpdate {
            team: Team::Other,
            value: 3,
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "DP_UPDATE");
        assert_eq!(value["team"], "その他");
        assert_eq!(value["value"], 3);
    }

    #[test]
    fn state_sync_is_flattened() {
        let mut state = BoardState::default();
        state.users.push("Alice".into());
        state
            .units
            .push(Unit::character(EntityId::new("a1"), "room-x", "Bob"));
        state.messages.push(ChatMessage {
            id: "m1".into(),
            room_id: "room-x".into(),
            handle_name: "Alice".into(),
            content: "hi".into(),
            is_system: false,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        });

        let message = SyncMessage::StateSync(state);
        let bytes = encode(&message).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "STATE_SYNC");
        assert_eq!(value["users"][0], "Alice");
        assert_eq!(value["counters"]["生徒会"], 0);

        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn update_carries_only_patched_fields() {
        let message = SyncMessage::UnitUpdate {
            patch: UnitPatch {
                hp: Some(1),
                ..UnitPatch::new(EntityId::new("z"))
            },
        };
        let bytes = encode(&message).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"type":"UNIT_UPDATE","patch":{"id":"z","hp":1}}"#
        );
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = decode(br#"{"type":"TELEPORT","id":"q"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(decode(b"\x00\x01not json").is_err());
        assert!(decode(br#"{"type":"UNIT_DELETE"}"#).is_err());
    }
}
