//! Pre-shared-key encrypted channel.
//!
//! Both sides exchange a random 16-byte salt in the clear, then derive one
//! ChaCha20-Poly1305 key per direction from the negotiated PSK and both
//! salts. Everything after the salt exchange travels in length-prefixed AEAD
//! frames with counter nonces; a frame that fails to decrypt means the peer
//! does not hold the key (or the stream desynchronized) and is fatal.

use bytes::{Buf, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

use super::{Transport, TransportError, WireReader, WireWriter};

/// Domain separator for key derivation.
const STREAM_CONTEXT: &[u8] = b"cirrus.stream.v1";
/// Salt each side contributes to key derivation.
const SALT_LEN: usize = 16;
/// Plaintext bytes per frame. Large enough that a 256 KiB file block fits
/// in one frame.
const FRAME_DATA_MAX: usize = 256 * 1024;
/// Poly1305 authentication tag.
const TAG_LEN: usize = 16;

fn derive_key(psk: &[u8], sender_salt: &[u8], receiver_salt: &[u8]) -> ChaCha20Poly1305 {
    let mut hasher = Sha256::new();
    hasher.update(STREAM_CONTEXT);
    hasher.update(psk);
    hasher.update(sender_salt);
    hasher.update(receiver_salt);
    let key = hasher.finalize();
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

fn nonce_for(counter: u64) -> Nonce {
    let mut raw = [0u8; 12];
    raw[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(raw)
}

/// Upgrade plaintext wire halves to the encrypted channel.
///
/// Must be called at the same protocol point on both sides; the salt
/// exchange is the first thing on the wire after STARTTLS.
pub async fn upgrade<T: Transport>(
    reader: WireReader<T>,
    writer: WireWriter<T>,
    psk: &[u8],
) -> Result<(WireReader<T>, WireWriter<T>), TransportError> {
    let inner_reader = match reader {
        WireReader::Plain(r) => r,
        WireReader::Secure(_) => return Err(TransportError::AlreadySecure),
    };
    let mut inner_writer = match writer {
        WireWriter::Plain(w) => w,
        WireWriter::Secure(_) => return Err(TransportError::AlreadySecure),
    };

    let mut our_salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut our_salt).expect("failed to generate random bytes");
    inner_writer.write_all(&our_salt).await?;
    inner_writer.flush().await?;

    let mut reader = inner_reader;
    let mut peer_salt = [0u8; SALT_LEN];
    reader.read_exact(&mut peer_salt).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::ConnectionLost
        } else {
            TransportError::Io(e)
        }
    })?;

    let send_cipher = derive_key(psk, &our_salt, &peer_salt);
    let recv_cipher = derive_key(psk, &peer_salt, &our_salt);

    Ok((
        WireReader::Secure(SecureReader {
            inner: reader,
            cipher: recv_cipher,
            counter: 0,
            decrypted: BytesMut::new(),
        }),
        WireWriter::Secure(SecureWriter {
            inner: inner_writer,
            cipher: send_cipher,
            counter: 0,
        }),
    ))
}

/// Decrypting side of the channel. Buffers one frame's plaintext at a time.
pub struct SecureReader<T: Transport> {
    inner: BufReader<ReadHalf<T>>,
    cipher: ChaCha20Poly1305,
    counter: u64,
    decrypted: BytesMut,
}

impl<T: Transport> SecureReader<T> {
    /// Pull and decrypt the next frame into the plaintext buffer.
    async fn fill(&mut self) -> Result<(), TransportError> {
        let mut len_raw = [0u8; 4];
        self.inner.read_exact(&mut len_raw).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::ConnectionLost
            } else {
                TransportError::Io(e)
            }
        })?;
        let len = u32::from_be_bytes(len_raw) as usize;
        if len == 0 || len > FRAME_DATA_MAX + TAG_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut ciphertext = vec![0u8; len];
        self.inner.read_exact(&mut ciphertext).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::ConnectionLost
            } else {
                TransportError::Io(e)
            }
        })?;

        let plaintext = self
            .cipher
            .decrypt(&nonce_for(self.counter), ciphertext.as_ref())
            .map_err(|_| TransportError::Authentication)?;
        self.counter += 1;
        self.decrypted.extend_from_slice(&plaintext);
        Ok(())
    }

    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.decrypted.iter().position(|&b| b == b'\n') {
                let line = self.decrypted.split_to(pos + 1);
                let text = std::str::from_utf8(&line[..pos]).map_err(|_| TransportError::NotUtf8)?;
                return Ok(text.to_string());
            }
            self.fill().await?;
        }
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        while self.decrypted.len() < buf.len() {
            self.fill().await?;
        }
        self.decrypted.copy_to_slice(buf);
        Ok(())
    }
}

/// Encrypting side of the channel.
pub struct SecureWriter<T: Transport> {
    inner: WriteHalf<T>,
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl<T: Transport> SecureWriter<T> {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        for block in data.chunks(FRAME_DATA_MAX) {
            let ciphertext = self
                .cipher
                .encrypt(&nonce_for(self.counter), block)
                .map_err(|_| TransportError::Authentication)?;
            self.counter += 1;
            self.inner
                .write_all(&(ciphertext.len() as u32).to_be_bytes())
                .await?;
            self.inner.write_all(&ciphertext).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(self.inner.flush().await?)
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        Ok(self.inner.shutdown().await?)
    }
}
