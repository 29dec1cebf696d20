//! Turning "peer X might be at address Y" into connections.
//!
//! Discovery sources (a tracker, LAN broadcast, a static peer list) all
//! reduce to [`DiscoveryHint`]s fed into one queue. The [`Dispatcher`]
//! drains it, filters out hints that are unresolvable, ourselves, or
//! already covered by a live connection, and hands the survivors to an
//! [`OutboundConnector`] — the seam where the daemon plugs in actual TCP
//! dialing and tests plug in whatever they like.

use std::sync::Arc;

use async_trait::async_trait;

use crate::connection::ConnectionRegistry;
use crate::share::{IdMatch, Shares};

/// Transport scheme for hints; the only one dialed today.
pub const PROTOCOL_TCP: &str = "tcp";

/// One claim from a discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryHint {
    /// Share or access-code id the peer is reachable under.
    pub id: String,
    /// The remote node's peer id within that share.
    pub peer_id: String,
    /// Transport the peer listens on, e.g. [`PROTOCOL_TCP`]. Sources pass
    /// whatever they heard; the connector decides what it can dial.
    pub protocol: String,
    pub address: String,
    pub port: u16,
}

/// Dials a hint and runs the connection to completion.
#[async_trait]
pub trait OutboundConnector: Send + Sync {
    async fn connect(&self, hint: DiscoveryHint) -> anyhow::Result<()>;
}

/// Filters hints and dispatches the ones worth dialing.
pub struct Dispatcher {
    shares: Shares,
    registry: ConnectionRegistry,
    connector: Arc<dyn OutboundConnector>,
}

impl Dispatcher {
    pub fn new(
        shares: Shares,
        registry: ConnectionRegistry,
        connector: Arc<dyn OutboundConnector>,
    ) -> Self {
        Dispatcher {
            shares,
            registry,
            connector,
        }
    }

    /// Drain hints until the queue closes.
    pub async fn run(&self, hints: flume::Receiver<DiscoveryHint>) {
        while let Ok(hint) = hints.recv_async().await {
            self.dispatch(hint);
        }
    }

    fn dispatch(&self, hint: DiscoveryHint) {
        let Some(id_match) = self.shares.find_id(&hint.id) else {
            tracing::trace!(id = %hint.id, "hint for an id we do not hold");
            return;
        };
        let (slot_id, our_peer_id) = match &id_match {
            IdMatch::Share(share) => (share.id().to_string(), share.peer_id()),
            IdMatch::Code { share, code } => (code.id(), share.peer_id()),
            IdMatch::Pending(pending) => (pending.id(), pending.peer_id().to_string()),
        };
        if hint.peer_id == our_peer_id {
            // Our own announcement reflected back at us.
            return;
        }
        if !self.registry.begin(&slot_id, &hint.peer_id) {
            tracing::trace!(
                id = %slot_id,
                peer = %hint.peer_id,
                "already connected or connecting"
            );
            return;
        }

        let registry = self.registry.clone();
        let connector = self.connector.clone();
        tokio::spawn(async move {
            let peer_id = hint.peer_id.clone();
            if let Err(e) = connector.connect(hint).await {
                tracing::debug!(peer = %peer_id, "outbound connection failed: {e:#}");
            }
            registry.disconnected(&slot_id, &peer_id);
        });
    }
}
