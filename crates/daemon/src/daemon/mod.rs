//! The daemon: assembles shares, listens for peers, dials hints.
//!
//! One TCP listener accepts inbound connections; a [`Dispatcher`] fed by
//! discovery sources (currently the static peer list, re-announced
//! periodically) drives outbound ones. Both funnel into the same handshake
//! and session code in `common` — a connection behaves identically
//! regardless of who dialed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::access::AccessCode;
use common::connection::ConnectionRegistry;
use common::discovery::{self, Dispatcher, DiscoveryHint, OutboundConnector};
use common::handshake::{self, HandshakeConfig, HANDSHAKE_DEADLINE};
use common::share::{MemoryStore, Share, Shares, Store};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::Config;
use crate::store::{share_store_path, store_dir, DiskStore};

/// How often the static peer list is re-announced to the dispatcher, which
/// drops hints for pairs that are already connected.
const REDIAL_INTERVAL: Duration = Duration::from_secs(30);

pub struct Daemon {
    dir: PathBuf,
    config: Config,
    shares: Shares,
    registry: ConnectionRegistry,
    handshake: HandshakeConfig,
}

impl Daemon {
    /// Load every configured share and pending code from `dir`.
    pub fn new(dir: &Path, config: Config) -> Result<Self> {
        let shares = Shares::new();

        for entry in &config.shares {
            let store = DiskStore::open(&share_store_path(dir, &entry.path))
                .with_context(|| format!("opening store for {}", entry.path.display()))?;
            let share = match Share::open(&entry.path, store.clone())? {
                Some(share) => share,
                None => Share::create(&entry.path, store)?,
            };
            tracing::info!(id = %share.id(), path = %entry.path.display(), "share loaded");
            shares.insert(share);
        }

        // Shares materialized from access codes on earlier runs are known
        // only by their store files.
        for store_path in materialized_stores(dir)? {
            let store = DiskStore::open(&store_path)?;
            let Some(root) = store
                .get("path")
                .and_then(|raw| String::from_utf8(raw).ok())
            else {
                tracing::warn!(store = %store_path.display(), "store without a root path, skipping");
                continue;
            };
            if let Some(share) = Share::open(Path::new(&root), store)? {
                if shares.get(share.id()).is_none() {
                    tracing::info!(id = %share.id(), path = %root, "share loaded");
                    shares.insert(share);
                }
            }
        }

        for entry in &config.pending {
            if shares.all().iter().any(|s| s.path() == entry.path) {
                // Redeemed on an earlier run; the share exists now.
                continue;
            }
            let code = AccessCode::parse(&entry.code)
                .with_context(|| format!("pending code for {}", entry.path.display()))?;
            tracing::info!(id = %code.id(), path = %entry.path.display(), "holding access code");
            shares.add_pending(code, entry.path.clone());
        }

        let handshake = HandshakeConfig {
            software: format!("cirrus {}", env!("CARGO_PKG_VERSION")),
            friendly_name: config.friendly_name.clone(),
            encryption: config.encryption,
            stores: {
                let dir = dir.to_path_buf();
                Arc::new(move |id: &str| -> Arc<dyn Store> {
                    let path = store_dir(&dir).join(format!("{id}.json"));
                    match DiskStore::open(&path) {
                        Ok(store) => store,
                        Err(e) => {
                            tracing::error!(
                                store = %path.display(),
                                "falling back to in-memory store: {e}"
                            );
                            Arc::new(MemoryStore::new())
                        }
                    }
                })
            },
        };

        Ok(Daemon {
            dir: dir.to_path_buf(),
            config,
            shares,
            registry: ConnectionRegistry::new(),
            handshake,
        })
    }

    pub fn shares(&self) -> &Shares {
        &self.shares
    }

    /// Listen, dial, and keep doing both until shutdown.
    pub async fn run(self) -> Result<()> {
        let daemon = Arc::new(self);

        let listener = TcpListener::bind(("0.0.0.0", daemon.config.listen_port))
            .await
            .with_context(|| format!("binding port {}", daemon.config.listen_port))?;
        tracing::info!(
            port = daemon.config.listen_port,
            name = %daemon.config.friendly_name,
            dir = %daemon.dir.display(),
            "cirrus listening"
        );

        let (hint_tx, hint_rx) = flume::unbounded();
        let connector = Arc::new(TcpConnector {
            shares: daemon.shares.clone(),
            registry: daemon.registry.clone(),
            handshake: daemon.handshake.clone(),
        });
        let dispatcher = Dispatcher::new(
            daemon.shares.clone(),
            daemon.registry.clone(),
            connector,
        );
        tokio::spawn(async move { dispatcher.run(hint_rx).await });

        {
            let daemon = daemon.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(REDIAL_INTERVAL);
                loop {
                    ticker.tick().await;
                    daemon.announce_static_peers(&hint_tx);
                }
            });
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::debug!(%addr, "inbound connection");
            let daemon = daemon.clone();
            tokio::spawn(async move {
                daemon.handle_incoming(stream).await;
            });
        }
    }

    /// Offer every advertised id to every statically configured peer; the
    /// dispatcher discards pairs that are already connected.
    fn announce_static_peers(&self, hints: &flume::Sender<DiscoveryHint>) {
        for peer in &self.config.peers {
            for (id, _) in self.shares.advertised() {
                let hint = DiscoveryHint {
                    id,
                    // The true peer id is only learned during the
                    // handshake; the synthetic one keys the dial slot.
                    peer_id: format!("static:{}:{}", peer.address, peer.port),
                    protocol: discovery::PROTOCOL_TCP.to_string(),
                    address: peer.address.clone(),
                    port: peer.port,
                };
                if hints.send(hint).is_err() {
                    return;
                }
            }
        }
    }

    async fn handle_incoming(&self, stream: TcpStream) {
        let auth = match timeout(
            HANDSHAKE_DEADLINE,
            handshake::incoming(stream, &self.shares, &self.handshake),
        )
        .await
        {
            Ok(Ok(auth)) => auth,
            Ok(Err(e)) => {
                tracing::debug!("inbound handshake failed: {e}");
                return;
            }
            Err(_) => {
                tracing::debug!("inbound handshake timed out");
                return;
            }
        };

        if !self
            .registry
            .begin(auth.share.id(), &auth.remote_peer_id)
        {
            tracing::debug!(
                share = %auth.share.id(),
                peer = %auth.remote_peer_id,
                "dropping duplicate connection"
            );
            return;
        }
        let _ = common::connection::run(auth, self.registry.clone()).await;
    }
}

struct TcpConnector {
    shares: Shares,
    registry: ConnectionRegistry,
    handshake: HandshakeConfig,
}

#[async_trait]
impl OutboundConnector for TcpConnector {
    async fn connect(&self, hint: DiscoveryHint) -> Result<()> {
        if hint.protocol != discovery::PROTOCOL_TCP {
            anyhow::bail!("cannot dial {} peers", hint.protocol);
        }
        let stream = TcpStream::connect((hint.address.as_str(), hint.port))
            .await
            .with_context(|| format!("dialing {}:{}", hint.address, hint.port))?;
        let auth = timeout(
            HANDSHAKE_DEADLINE,
            handshake::outgoing(stream, &self.shares, &hint.id, &self.handshake),
        )
        .await
        .context("handshake timed out")??;
        common::connection::run(auth, self.registry.clone()).await?;
        Ok(())
    }
}

/// Store files under the shares directory that are not claimed by a
/// configured share path.
fn materialized_stores(dir: &Path) -> Result<Vec<PathBuf>> {
    let shares_dir = store_dir(dir);
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(&shares_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(out)
}
