// Length-delimited frames over a byte stream.
//
// Used on the broker's TCP sessions: each frame is a 4-byte big-endian length
// followed by that many payload bytes. The payload is JSON produced by the
// caller; this module never looks inside it.
//
// `MAX_FRAME_SIZE` bounds what a peer can make us allocate. A full board
// snapshot with a long chat log is the largest thing we send and stays far
// below it.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Largest accepted payload (4 MiB).
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True when the peer simply went away (clean EOF or reset).
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            FrameError::TooLarge(_) => false,
        }
    }
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge(payload.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Blocks until the whole payload has arrived.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_stay_separate() {
        let mut wire = Vec::new();
        for payload in [&b"open"[..], b"", b"send some bytes"] {
            write_frame(&mut wire, payload).unwrap();
        }

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap(), b"open");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"");
        assert_eq!(read_frame(&mut cursor).unwrap(), b"send some bytes");
        assert!(read_frame(&mut cursor).unwrap_err().is_disconnect());
    }

    #[test]
    fn oversized_write_is_refused() {
        let big = vec![7u8; MAX_FRAME_SIZE as usize + 1];
        let err = write_frame(&mut Vec::new(), &big).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }

    #[test]
    fn oversized_header_is_refused_before_allocating() {
        let header = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let err = read_frame(&mut Cursor::new(header.to_vec())).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
        assert!(!err.is_disconnect());
    }

    #[test]
    fn truncated_payload_is_a_disconnect() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let err = read_frame(&mut Cursor::new(wire)).unwrap_err();
        assert!(err.is_disconnect());
    }
}
