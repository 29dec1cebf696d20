//! Post-handshake connection machinery: the session loops, the update
//! acceptance rules, file transfer, and the node-wide registry that keeps
//! connections to one per (share, peer) pair.

mod registry;
mod session;
mod transfer;
mod update;

pub use registry::ConnectionRegistry;
pub use session::{run, MIN_PING_INTERVAL};
pub use update::{apply as apply_update, need_file, UpdateOutcome};

use crate::access::AccessLevel;
use crate::message::MessageError;
use crate::share::ShareError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{what} requires more than {level} access")]
    AccessDenied {
        what: &'static str,
        level: AccessLevel,
    },
    #[error("peer sent an unsupported {0} message")]
    Unsupported(&'static str),
    #[error("peer stopped answering pings")]
    PeerTimeout,
    #[error("session queue closed")]
    Closed,
}
