//! Protocol messages: the JSON vocabulary and the stream framing.

mod codec;
mod payload;

pub use codec::{Message, MessageReader, MessageWriter, FILE_BLOCK, MAX_CHUNK};
pub use payload::{ByteRange, FileEntry, KeySet, Payload};

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("message has no type")]
    NoType,
    #[error("message not a JSON object: {0:?}")]
    NotJson(String),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("previous message's binary payload has not been read")]
    UnreadPayload,
    #[error("message has no binary payload")]
    NoBinaryPayload,
    #[error("invalid binary payload chunk boundary: {0:?}")]
    BadChunkBoundary(String),
    #[error("binary chunk of {0} bytes is too large")]
    ChunkTooLarge(usize),
    #[error("message is not signed")]
    NotSigned,
    #[error("signature verification failed")]
    BadSignature,
    #[error("newlines are not allowed in message JSON")]
    EmbeddedNewline,
}

impl MessageError {
    /// Errors after which the byte stream can no longer be trusted to be
    /// aligned on a message boundary. These end the session; anything else
    /// is logged and the receive loop continues.
    pub fn desynchronizes_stream(&self) -> bool {
        matches!(
            self,
            MessageError::Transport(_)
                | MessageError::UnreadPayload
                | MessageError::BadChunkBoundary(_)
                | MessageError::ChunkTooLarge(_)
                | MessageError::NotJson(_)
        )
    }
}
