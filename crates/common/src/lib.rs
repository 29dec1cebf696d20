/**
 * Access levels and the Base32 access codes that
 *  grant them, with Luhn mod 32 check characters.
 */
pub mod access;
/**
 * Post-handshake machinery: session loops, update
 *  acceptance rules, file transfer, and the
 *  one-connection-per-peer registry.
 */
pub mod connection;
/**
 * Discovery hints and the dispatcher that turns
 *  them into outbound connection attempts.
 */
pub mod discovery;
/**
 * The connection handshake: greeting through
 *  identity, including channel encryption and
 *  access-code key exchange.
 */
pub mod handshake;
/**
 * The wire vocabulary and its framing: line-JSON
 *  messages, signatures, chunked binary payloads.
 */
pub mod message;
/**
 * Share state: file records, key rings, peer
 *  knowledge, persistence and path guards.
 */
pub mod share;
/**
 * Byte-stream transports and the in-place upgrade
 *  to the PSK-encrypted channel.
 */
pub mod transport;

pub mod prelude {
    pub use crate::access::{AccessCode, AccessLevel, CodeKind};
    pub use crate::connection::ConnectionRegistry;
    pub use crate::discovery::{Dispatcher, DiscoveryHint, OutboundConnector};
    pub use crate::handshake::{Authenticated, HandshakeConfig};
    pub use crate::message::{FileEntry, MessageReader, MessageWriter, Payload};
    pub use crate::share::{FileRecord, Share, Shares, Store};
    pub use crate::transport::Transport;
}
