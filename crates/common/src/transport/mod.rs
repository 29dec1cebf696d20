//! Byte-stream transport beneath the message framing.
//!
//! Sessions run over anything that behaves like a reliable duplex stream:
//! `TcpStream` in the daemon, `tokio::io::duplex` in tests, a uTP stream
//! eventually. [`Transport`] is the seam. After the handshake's STARTTLS
//! step both directions are upgraded in place to a pre-shared-key encrypted
//! channel (see [`secure`]); the message codec reads and writes through
//! [`WireReader`]/[`WireWriter`] and never knows the difference.

mod secure;

pub use secure::{upgrade, SecureReader, SecureWriter};

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};

/// A reliable duplex byte stream a peer session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// Errors from the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("peer does not hold the pre-shared key")]
    Authentication,
    #[error("encrypted frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("stream is already encrypted")]
    AlreadySecure,
    #[error("non-utf8 data where a protocol line was expected")]
    NotUtf8,
}

/// Reading half of a connection, plaintext or PSK-encrypted.
pub enum WireReader<T: Transport> {
    Plain(BufReader<ReadHalf<T>>),
    Secure(SecureReader<T>),
}

/// Writing half of a connection, plaintext or PSK-encrypted.
pub enum WireWriter<T: Transport> {
    Plain(WriteHalf<T>),
    Secure(SecureWriter<T>),
}

/// Split a raw stream into plaintext wire halves.
pub fn wire_pair<T: Transport>(stream: T) -> (WireReader<T>, WireWriter<T>) {
    let (read, write) = tokio::io::split(stream);
    (
        WireReader::Plain(BufReader::new(read)),
        WireWriter::Plain(write),
    )
}

impl<T: Transport> WireReader<T> {
    /// Read one newline-terminated protocol line, without the newline.
    /// A closed stream is reported as [`TransportError::ConnectionLost`].
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        match self {
            WireReader::Plain(reader) => {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    return Err(TransportError::ConnectionLost);
                }
                if line.ends_with('\n') {
                    line.pop();
                }
                Ok(line)
            }
            WireReader::Secure(reader) => reader.read_line().await,
        }
    }

    /// Read exactly `buf.len()` bytes.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        match self {
            WireReader::Plain(reader) => {
                reader.read_exact(buf).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        TransportError::ConnectionLost
                    } else {
                        TransportError::Io(e)
                    }
                })?;
                Ok(())
            }
            WireReader::Secure(reader) => reader.read_exact(buf).await,
        }
    }
}

impl<T: Transport> WireWriter<T> {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self {
            WireWriter::Plain(writer) => Ok(writer.write_all(data).await?),
            WireWriter::Secure(writer) => writer.write_all(data).await,
        }
    }

    pub async fn flush(&mut self) -> Result<(), TransportError> {
        match self {
            WireWriter::Plain(writer) => Ok(writer.flush().await?),
            WireWriter::Secure(writer) => writer.flush().await,
        }
    }

    /// Flush and shut the stream down, signalling the remote loops.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self {
            WireWriter::Plain(writer) => Ok(writer.shutdown().await?),
            WireWriter::Secure(writer) => writer.shutdown().await,
        }
    }
}
