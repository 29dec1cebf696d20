//! A live peer session.
//!
//! After the handshake, three concerns run concurrently until either side
//! goes away:
//!
//! - the **send loop** owns the writer and drains a FIFO queue, so replies,
//!   pings, live updates and streamed file payloads never interleave on the
//!   wire;
//! - the **receive loop** owns the reader and dispatches one message at a
//!   time;
//! - the **ping loop** keeps the connection warm and watches the deadline
//!   the receive loop refreshes; a peer that stops talking is declared dead
//!   rather than holding its registry slot forever.
//!
//! Handler failures (a file that vanished, a hash mismatch) are logged and
//! the session continues; only errors that desynchronize the framing tear
//! the connection down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::access::AccessLevel;
use crate::handshake::Authenticated;
use crate::message::{Message, MessageReader, MessageWriter, Payload, FILE_BLOCK};
use crate::share::{FileRecord, Peer, Share, SubscriptionId};
use crate::transport::Transport;

use super::registry::ConnectionRegistry;
use super::{transfer, update, SessionError};

/// Seconds between pings, and the interval we announce to the peer.
pub const MIN_PING_INTERVAL: u64 = 60;

/// Grace multiplier on the peer's announced interval before it is
/// considered dead.
const TIMEOUT_MARGIN: f64 = 1.1;

fn deadline_after(interval: u64) -> Instant {
    Instant::now() + Duration::from_secs_f64(interval as f64 * TIMEOUT_MARGIN)
}

/// The peer's announced ping interval, floor-clamped so a bogus tiny
/// timeout cannot make the watchdog fire between our own pings.
fn clamp_ping_interval(timeout: u64) -> u64 {
    timeout.max(MIN_PING_INTERVAL)
}

/// Something queued for the send loop.
enum Outbound {
    Message(Payload),
    /// A `file_data` header followed by the file's bytes, streamed in
    /// blocks so one large file cannot hold memory hostage.
    File {
        header: Payload,
        file: tokio::fs::File,
        remaining: u64,
    },
}

/// Cloneable sender into the session's outbound queue.
#[derive(Clone)]
struct SessionHandle {
    tx: flume::Sender<Outbound>,
}

impl SessionHandle {
    fn send(&self, payload: Payload) -> Result<(), SessionError> {
        self.tx
            .send(Outbound::Message(payload))
            .map_err(|_| SessionError::Closed)
    }

    fn send_file(
        &self,
        header: Payload,
        file: tokio::fs::File,
        remaining: u64,
    ) -> Result<(), SessionError> {
        self.tx
            .send(Outbound::File {
                header,
                file,
                remaining,
            })
            .map_err(|_| SessionError::Closed)
    }
}

/// Drive an authenticated connection until it ends.
pub async fn run<T: Transport>(
    conn: Authenticated<T>,
    registry: ConnectionRegistry,
) -> Result<(), SessionError> {
    let Authenticated {
        share,
        remote_peer_id,
        access,
        reader,
        writer,
        ..
    } = conn;

    let timeout_at = Arc::new(Mutex::new(deadline_after(MIN_PING_INTERVAL)));
    registry.connected(share.id(), &remote_peer_id, timeout_at.clone());

    let (tx, rx) = flume::unbounded();
    let handle = SessionHandle { tx };

    // Live local changes flow out as update messages, but only once the
    // peer has requested a manifest; the first get_manifest hands the
    // change receiver to the forwarding loop.
    let (subscriber, subscriptions) = flume::bounded(1);
    let subscription = Mutex::new(None);

    let signing = share.signing_key(AccessLevel::ReadWrite);
    let send_task = tokio::spawn(send_loop(writer, rx, signing));

    let peer = share.peer(&remote_peer_id);

    // Open by asking for everything newer than what we already know.
    if access >= AccessLevel::ReadOnly {
        let since = peer.lock().manifest().map(|m| m.version);
        handle.send(Payload::GetManifest { version: since })?;
    }

    let peer_interval = Mutex::new(MIN_PING_INTERVAL);
    let mut session = SessionState {
        share: &share,
        peer: &peer,
        access,
        handle: &handle,
        timeout_at: &timeout_at,
        peer_interval: &peer_interval,
        subscriber: &subscriber,
        subscription: &subscription,
    };

    let result = tokio::select! {
        r = receive_loop(reader, &mut session) => r,
        _ = ping_loop(&handle, &timeout_at) => Err(SessionError::PeerTimeout),
        _ = forward_changes(subscriptions, &handle) => Err(SessionError::Closed),
    };

    if let Some(token) = *subscription.lock() {
        share.unsubscribe(token);
    }
    drop(handle);
    let _ = send_task.await;
    registry.disconnected(share.id(), &remote_peer_id);

    match &result {
        Ok(()) => tracing::info!(share = %share.id(), peer = %remote_peer_id, "session closed"),
        Err(e) => {
            tracing::info!(share = %share.id(), peer = %remote_peer_id, "session ended: {e}")
        }
    }
    result
}

async fn send_loop<T: Transport>(
    mut writer: MessageWriter<T>,
    rx: flume::Receiver<Outbound>,
    signing: Option<ed25519_dalek::SigningKey>,
) -> Result<(), SessionError> {
    while let Ok(outbound) = rx.recv_async().await {
        match outbound {
            Outbound::Message(payload) => {
                tracing::trace!("sending {payload}");
                let signable = matches!(
                    payload,
                    Payload::Manifest { .. } | Payload::Update { .. }
                );
                match &signing {
                    Some(key) if signable => writer.send_signed(&payload, key).await?,
                    _ => writer.send(&payload).await?,
                }
            }
            Outbound::File {
                header,
                mut file,
                mut remaining,
            } => {
                writer.send_with_binary(&header, None).await?;
                let mut buf = vec![0u8; FILE_BLOCK];
                while remaining > 0 {
                    let want = remaining.min(FILE_BLOCK as u64) as usize;
                    let n = file.read(&mut buf[..want]).await?;
                    if n == 0 {
                        // File shrank under us; the receiver's hash check
                        // will discard the short payload.
                        break;
                    }
                    writer.write_chunk(&buf[..n]).await?;
                    remaining -= n as u64;
                }
                writer.finish_binary().await?;
            }
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn ping_loop(handle: &SessionHandle, timeout_at: &Arc<Mutex<Instant>>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(MIN_PING_INTERVAL));
    loop {
        ticker.tick().await;
        if Instant::now() >= *timeout_at.lock() {
            return;
        }
        if handle
            .send(Payload::Ping {
                timeout: MIN_PING_INTERVAL,
            })
            .is_err()
        {
            return;
        }
    }
}

async fn forward_changes(
    subscriptions: flume::Receiver<flume::Receiver<FileRecord>>,
    handle: &SessionHandle,
) {
    // Pends until the peer's first get_manifest delivers the receiver; a
    // peer that never asks gets no updates.
    let Ok(changes) = subscriptions.recv_async().await else {
        std::future::pending::<()>().await;
        return;
    };
    while let Ok(record) = changes.recv_async().await {
        if handle
            .send(Payload::Update {
                file: record.to_entry(),
            })
            .is_err()
        {
            return;
        }
    }
}

struct SessionState<'a> {
    share: &'a Share,
    peer: &'a Arc<Mutex<Peer>>,
    access: AccessLevel,
    handle: &'a SessionHandle,
    timeout_at: &'a Arc<Mutex<Instant>>,
    peer_interval: &'a Mutex<u64>,
    subscriber: &'a flume::Sender<flume::Receiver<FileRecord>>,
    subscription: &'a Mutex<Option<SubscriptionId>>,
}

async fn receive_loop<T: Transport>(
    mut reader: MessageReader<T>,
    session: &mut SessionState<'_>,
) -> Result<(), SessionError> {
    loop {
        let message = reader.read().await?;
        // Any traffic proves the peer is alive.
        *session.timeout_at.lock() = deadline_after(*session.peer_interval.lock());
        tracing::trace!("received {}", message.payload);

        match handle_message(&mut reader, session, message).await {
            Ok(()) => {}
            Err(e) => {
                let fatal = match &e {
                    SessionError::Message(m) => m.desynchronizes_stream(),
                    SessionError::Unsupported(_) => true,
                    _ => false,
                };
                if fatal {
                    return Err(e);
                }
                tracing::warn!("error handling message: {e}");
                // Leave the framing consistent before the next header.
                reader.drain_binary().await?;
            }
        }
    }
}

async fn handle_message<T: Transport>(
    reader: &mut MessageReader<T>,
    session: &mut SessionState<'_>,
    message: Message,
) -> Result<(), SessionError> {
    // Manifest and update claims from signing-capable shares must carry a
    // valid signature; a bad one is a forgery, not a glitch.
    if matches!(
        message.payload,
        Payload::Manifest { .. } | Payload::Update { .. }
    ) {
        if message.signature.is_some() {
            if let Some(key) = session.share.verifying_key(AccessLevel::ReadWrite) {
                message.verify(&key)?;
            }
        }
    }

    match message.payload {
        Payload::Ping { timeout } => {
            *session.peer_interval.lock() = clamp_ping_interval(timeout);
            Ok(())
        }

        Payload::GetManifest { version } => {
            session.require(AccessLevel::ReadOnly, "get_manifest")?;
            // The first manifest request also opts the peer into live
            // updates. Subscribing before the snapshot is taken means a
            // change lands in one or the other, never neither.
            {
                let mut sub = session.subscription.lock();
                if sub.is_none() {
                    let (token, changes) = session.share.subscribe();
                    *sub = Some(token);
                    let _ = session.subscriber.send(changes);
                }
            }
            let current = session.share.version();
            if version == Some(current) {
                session.handle.send(Payload::ManifestCurrent)?;
            } else {
                // Files the hasher has not reached yet are announced
                // later, as updates; a manifest claim without a digest
                // would be unverifiable.
                let files = session
                    .share
                    .files()
                    .iter()
                    .filter(|record| record.deleted || record.sha256.is_some())
                    .map(FileRecord::to_entry)
                    .collect();
                session.handle.send(Payload::Manifest {
                    peer: session.share.peer_id(),
                    version: current,
                    files,
                })?;
            }
            Ok(())
        }

        Payload::ManifestCurrent => {
            tracing::debug!(share = %session.share.id(), "peer manifest unchanged");
            Ok(())
        }

        Payload::Manifest {
            version, files, ..
        } => {
            session.require(AccessLevel::ReadOnly, "manifest")?;
            session.peer.lock().set_manifest(version, files.clone());

            let mut wanted = Vec::new();
            for entry in &files {
                match update::apply(session.share, entry)? {
                    update::UpdateOutcome::NeedsContent => wanted.push(entry.path.clone()),
                    update::UpdateOutcome::Applied | update::UpdateOutcome::Ignored => {}
                }
            }
            // Random order, so a node joining mid-swarm does not fetch in
            // the same order as everyone else.
            wanted.shuffle(&mut rand::rng());
            tracing::debug!(
                share = %session.share.id(),
                files = files.len(),
                wanted = wanted.len(),
                "manifest processed"
            );
            for path in wanted {
                session.handle.send(Payload::Get { path, range: None })?;
            }
            Ok(())
        }

        Payload::Update { file } => {
            session.require(AccessLevel::ReadOnly, "update")?;
            session.peer.lock().push_update(file.clone());
            if update::apply(session.share, &file)? == update::UpdateOutcome::NeedsContent {
                session.handle.send(Payload::Get {
                    path: file.path,
                    range: None,
                })?;
            }
            Ok(())
        }

        Payload::Move { .. } => Err(SessionError::Unsupported("move")),

        Payload::Get { path, range } => {
            session.require(AccessLevel::ReadOnly, "get")?;
            serve_file(session, &path, range).await
        }

        Payload::FileData { path, range } => {
            if range.is_some() {
                // We only ever request whole files.
                tracing::warn!(%path, "unsolicited ranged file_data, discarding");
                reader.drain_binary().await?;
                return Ok(());
            }
            let expected = session.peer.lock().find_file(&path).cloned();
            let Some(expected) = expected else {
                tracing::warn!(%path, "file_data for a path the peer never announced");
                reader.drain_binary().await?;
                return Ok(());
            };
            if !update::need_file(session.share, &expected) {
                // Raced with another peer delivering the same content.
                reader.drain_binary().await?;
                return Ok(());
            }
            transfer::receive_file(session.share, reader, &expected).await?;
            Ok(())
        }

        // Handshake vocabulary has no business here.
        other @ (Payload::Greeting { .. }
        | Payload::Start { .. }
        | Payload::CannotStart
        | Payload::Starttls { .. }
        | Payload::FakeTlsHandshake { .. }
        | Payload::Keys { .. }
        | Payload::KeysAcknowledgment
        | Payload::Identity { .. }) => {
            tracing::warn!("ignoring {} after handshake", other.kind());
            Ok(())
        }
    }
}

impl SessionState<'_> {
    fn require(&self, level: AccessLevel, what: &'static str) -> Result<(), SessionError> {
        if self.access >= level {
            Ok(())
        } else {
            Err(SessionError::AccessDenied {
                what,
                level: self.access,
            })
        }
    }
}

/// Queue a file's contents for the peer.
async fn serve_file(
    session: &SessionState<'_>,
    path: &str,
    range: Option<(u64, u64)>,
) -> Result<(), SessionError> {
    let Some(record) = session.share.file(path) else {
        tracing::warn!(%path, "get for unknown path");
        return Ok(());
    };
    if record.deleted {
        tracing::warn!(%path, "get for deleted path");
        return Ok(());
    }

    let std_file = session.share.open_file(path)?;
    let mut file = tokio::fs::File::from_std(std_file);
    let size = file.metadata().await?.len();

    let (start, len) = match range {
        Some((start, len)) => {
            let start = start.min(size);
            (start, len.min(size - start))
        }
        None => (0, size),
    };
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }

    session.handle.send_file(
        Payload::FileData {
            path: path.to_string(),
            range: range.map(|_| (start, len)),
        },
        file,
        len,
    )?;
    Ok(())
}
