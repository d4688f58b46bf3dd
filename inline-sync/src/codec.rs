//! Byte encoding for protocol envelopes.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};

/// Maximum accepted frame size (8 MB).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

pub fn encode_client(message: &ClientMessage) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_client(bytes: &[u8]) -> SyncResult<ClientMessage> {
    check_size(bytes)?;
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_server(message: &ServerMessage) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_server(bytes: &[u8]) -> SyncResult<ServerMessage> {
    check_size(bytes)?;
    Ok(serde_json::from_slice(bytes)?)
}

fn check_size(bytes: &[u8]) -> SyncResult<()> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(SyncError::Transport(format!(
            "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            bytes.len()
        )));
    }
    Ok(())
}
