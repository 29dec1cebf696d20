//! Message framing over a wire stream.
//!
//! One message is: optional `$` (signed), optional `!` (binary payload
//! follows), a single-line JSON object, `\n`. Signed messages append one
//! base64 signature line computed over the exact JSON bytes. A binary
//! payload is a chunk stream: `<decimal length>\n<bytes>` repeated, ended by
//! `0\n`. Chunk reads are pull-based; the reader refuses to fetch the next
//! header while a payload is unconsumed, because doing so would
//! desynchronize the stream.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::{MessageError, Payload};
use crate::transport::{Transport, WireReader, WireWriter};

/// Largest acceptable binary chunk. Rejects allocation attacks from
/// adversarial length prefixes.
pub const MAX_CHUNK: usize = 16 * 1024 * 1024;

/// Blocks this writer emits when streaming file contents.
pub const FILE_BLOCK: usize = 256 * 1024;

/// A decoded message header. The binary payload, if any, is still on the
/// wire and must be drained through [`MessageReader::read_chunk`].
#[derive(Debug)]
pub struct Message {
    pub payload: Payload,
    /// Signature and the exact JSON text it covers.
    pub signature: Option<(Vec<u8>, String)>,
    pub has_binary: bool,
}

impl Message {
    /// Verify the signature line against the JSON bytes as received.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), MessageError> {
        let (signature, json) = self.signature.as_ref().ok_or(MessageError::NotSigned)?;
        let signature =
            Signature::from_slice(signature).map_err(|_| MessageError::BadSignature)?;
        key.verify(json.as_bytes(), &signature)
            .map_err(|_| MessageError::BadSignature)
    }
}

/// Reads messages from the receiving half of a connection.
pub struct MessageReader<T: Transport> {
    wire: WireReader<T>,
    in_binary: bool,
}

impl<T: Transport> MessageReader<T> {
    pub fn new(wire: WireReader<T>) -> Self {
        Self {
            wire,
            in_binary: false,
        }
    }

    /// True while a binary payload is still being streamed.
    pub fn in_binary(&self) -> bool {
        self.in_binary
    }

    pub fn into_wire(self) -> WireReader<T> {
        self.wire
    }

    /// Read one message header (and signature line, if present).
    pub async fn read(&mut self) -> Result<Message, MessageError> {
        if self.in_binary {
            return Err(MessageError::UnreadPayload);
        }

        let mut line = self.wire.read_line().await?;
        let mut signed = false;
        let mut has_binary = false;

        if line.starts_with('$') {
            signed = true;
            line.remove(0);
        }
        if line.starts_with('!') {
            has_binary = true;
            line.remove(0);
        }
        if !line.starts_with('{') {
            return Err(MessageError::NotJson(line));
        }

        let value: serde_json::Value =
            serde_json::from_str(&line).map_err(|e| MessageError::Decode(e.to_string()))?;
        if value.get("type").is_none() {
            return Err(MessageError::NoType);
        }
        let payload: Payload =
            serde_json::from_value(value).map_err(|e| MessageError::Decode(e.to_string()))?;

        let signature = if signed {
            let sig_line = self.wire.read_line().await?;
            let raw = BASE64
                .decode(sig_line.trim())
                .map_err(|_| MessageError::BadSignature)?;
            Some((raw, line))
        } else {
            None
        };

        self.in_binary = has_binary;

        Ok(Message {
            payload,
            signature,
            has_binary,
        })
    }

    /// Pull the next binary chunk. `None` marks the end of the payload.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, MessageError> {
        if !self.in_binary {
            return Err(MessageError::NoBinaryPayload);
        }

        let len_line = self.wire.read_line().await?;
        if len_line.is_empty() || !len_line.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MessageError::BadChunkBoundary(len_line));
        }
        let len: usize = len_line
            .parse()
            .map_err(|_| MessageError::BadChunkBoundary(len_line))?;

        if len == 0 {
            self.in_binary = false;
            return Ok(None);
        }
        if len > MAX_CHUNK {
            return Err(MessageError::ChunkTooLarge(len));
        }

        let mut data = vec![0u8; len];
        self.wire.read_exact(&mut data).await?;
        Ok(Some(data))
    }

    /// Drain an unconsumed payload so the next header read stays in sync.
    pub async fn drain_binary(&mut self) -> Result<(), MessageError> {
        while self.in_binary {
            self.read_chunk().await?;
        }
        Ok(())
    }
}

/// Writes messages to the sending half of a connection.
pub struct MessageWriter<T: Transport> {
    wire: WireWriter<T>,
}

impl<T: Transport> MessageWriter<T> {
    pub fn new(wire: WireWriter<T>) -> Self {
        Self { wire }
    }

    pub fn into_wire(self) -> WireWriter<T> {
        self.wire
    }

    /// Send a complete message with no binary payload.
    pub async fn send(&mut self, payload: &Payload) -> Result<(), MessageError> {
        self.write_header(payload, None, false).await?;
        self.wire.flush().await?;
        Ok(())
    }

    /// Send a signed message with no binary payload.
    pub async fn send_signed(
        &mut self,
        payload: &Payload,
        key: &SigningKey,
    ) -> Result<(), MessageError> {
        self.write_header(payload, Some(key), false).await?;
        self.wire.flush().await?;
        Ok(())
    }

    /// Send a message header announcing a binary payload. The caller must
    /// follow with `write_chunk` calls and exactly one `finish_binary`.
    pub async fn send_with_binary(
        &mut self,
        payload: &Payload,
        key: Option<&SigningKey>,
    ) -> Result<(), MessageError> {
        self.write_header(payload, key, true).await
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<(), MessageError> {
        debug_assert!(!data.is_empty() && data.len() <= MAX_CHUNK);
        self.wire
            .write_all(format!("{}\n", data.len()).as_bytes())
            .await?;
        self.wire.write_all(data).await?;
        Ok(())
    }

    pub async fn finish_binary(&mut self) -> Result<(), MessageError> {
        self.wire.write_all(b"0\n").await?;
        self.wire.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), MessageError> {
        Ok(self.wire.shutdown().await?)
    }

    async fn write_header(
        &mut self,
        payload: &Payload,
        key: Option<&SigningKey>,
        has_binary: bool,
    ) -> Result<(), MessageError> {
        let json = serde_json::to_string(payload).map_err(|e| MessageError::Decode(e.to_string()))?;
        // serde_json never emits a raw newline inside a single-line object,
        // but the invariant is load-bearing for the framing.
        if json.contains('\n') {
            return Err(MessageError::EmbeddedNewline);
        }

        let mut line = String::with_capacity(json.len() + 3);
        if key.is_some() {
            line.push('$');
        }
        if has_binary {
            line.push('!');
        }
        line.push_str(&json);
        line.push('\n');
        self.wire.write_all(line.as_bytes()).await?;

        if let Some(key) = key {
            let signature = key.sign(json.as_bytes());
            let mut sig_line = BASE64.encode(signature.to_bytes());
            sig_line.push('\n');
            self.wire.write_all(sig_line.as_bytes()).await?;
        }
        Ok(())
    }
}
