// Room name → relay address.
//
// Rooms are not registered anywhere. Everybody who types the same room name
// dials (and, failing that, tries to claim) the same derived address, and
// that is the whole of room discovery. Unrelated groups picking the same name
// end up in the same room.

use dangeros_protocol::PeerAddress;

use crate::error::SessionError;

/// Prefix of every relay address.
pub const RELAY_PREFIX: &str = "dangeros-room-";

/// Prefix of the session's room id (stamped on units and chat lines).
pub const ROOM_ID_PREFIX: &str = "room-";

/// The well-known address of the relay for `room_name`.
pub fn resolve(room_name: &str) -> Result<PeerAddress, SessionError> {
    if room_name.is_empty() {
        return Err(SessionError::EmptyRoomName);
    }
    Ok(PeerAddress::new(format!("{RELAY_PREFIX}{room_name}")))
}

pub fn room_id(room_name: &str) -> String {
    format!("{ROOM_ID_PREFIX}{room_name}")
}
