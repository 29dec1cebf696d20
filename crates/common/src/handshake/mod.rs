//! Connection handshake.
//!
//! Every connection walks the same ladder regardless of who dialed:
//!
//! 1. `greeting` — the accepting side announces software and protocol
//!    versions.
//! 2. `start` — the dialing side names the share (or access code) id it
//!    wants and its access level; the accepting side answers `starttls`
//!    with the greatest common access, or `cannot_start`.
//! 3. The stream is upgraded in place to the PSK-encrypted channel (or,
//!    with encryption disabled, both sides prove key possession with a
//!    plaintext `fake_tls_handshake` exchange).
//! 4. If one side is redeeming an access code, the share holder sends
//!    `keys` and the redeemer acknowledges, materializing the share.
//! 5. `identity` — friendly names and a clock sanity check, both ways.
//!
//! Callers wrap the whole ladder in a deadline; a peer that stalls mid
//! handshake never ties up an accept slot indefinitely.

use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessLevel;
use crate::message::{MessageError, MessageReader, MessageWriter, Payload};
use crate::share::{IdMatch, KeyRing, Share, ShareError, Shares, Store};
use crate::transport::{self, Transport, TransportError};

/// Protocol revision this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum tolerated difference between peer clocks, in seconds. Beyond
/// this, `utime` comparisons are meaningless and sync must not proceed.
pub const CLOCK_SKEW_MAX: i64 = 60;

/// Outer deadline callers should apply around [`incoming`]/[`outgoing`].
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer does not speak protocol {PROTOCOL_VERSION}: offered {0:?}")]
    NoCommonProtocol(Vec<u32>),
    #[error("peer declined: no share or code matches the requested id")]
    CannotStart,
    #[error("no local share or code matches id {0}")]
    UnknownId(String),
    #[error("no pre-shared key at access level {0}")]
    NoKey(AccessLevel),
    #[error("peer failed the plaintext key possession check")]
    KeyMismatch,
    #[error("connected to ourselves")]
    SelfConnection,
    #[error("peer clock differs by {0}s, beyond the {CLOCK_SKEW_MAX}s limit")]
    ClockSkew(i64),
    #[error("expected {expected}, peer sent {got}")]
    Unexpected { expected: &'static str, got: String },
}

/// Node-level parameters for handshakes.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Software identification string, e.g. "cirrus 0.1.0".
    pub software: String,
    /// Human-readable node name sent in `identity`.
    pub friendly_name: String,
    /// When false, skip the encrypted channel and run the plaintext
    /// key-possession exchange instead. Test harnesses only.
    pub encryption: bool,
    /// Provides the persistence store for a share materialized by key
    /// exchange, keyed by share id.
    pub stores: Arc<dyn Fn(&str) -> Arc<dyn Store> + Send + Sync>,
}

impl HandshakeConfig {
    /// Config with encryption on and ephemeral stores.
    pub fn new(software: &str, friendly_name: &str) -> Self {
        HandshakeConfig {
            software: software.to_string(),
            friendly_name: friendly_name.to_string(),
            encryption: true,
            stores: Arc::new(|_| Arc::new(crate::share::MemoryStore::new())),
        }
    }
}

/// The result of a completed handshake: an encrypted, authenticated
/// connection bound to a share.
pub struct Authenticated<T: Transport> {
    pub share: Share,
    /// The remote node's stable id within the share.
    pub remote_peer_id: String,
    pub remote_name: Option<String>,
    /// Greatest common access level; every permission check downstream
    /// uses this.
    pub access: AccessLevel,
    pub reader: MessageReader<T>,
    pub writer: MessageWriter<T>,
}

struct Resolution {
    id_match: IdMatch,
    our_peer_id: String,
    our_access: AccessLevel,
}

fn resolve(shares: &Shares, id: &str) -> Result<Resolution, HandshakeError> {
    let id_match = shares
        .find_id(id)
        .ok_or_else(|| HandshakeError::UnknownId(id.to_string()))?;
    let (our_peer_id, our_access) = match &id_match {
        IdMatch::Share(share) => (share.peer_id(), share.access_level()),
        // Code channels run at unknown access until the key exchange
        // upgrades them.
        IdMatch::Code { share, .. } => (share.peer_id(), AccessLevel::Unknown),
        IdMatch::Pending(pending) => (pending.peer_id().to_string(), AccessLevel::Unknown),
    };
    Ok(Resolution {
        id_match,
        our_peer_id,
        our_access,
    })
}

/// The key both ends of this connection encrypt with. Share channels use
/// the psk of the negotiated tier; code channels use the code's payload,
/// the one secret both sides already hold.
fn channel_key(resolution: &Resolution, level: AccessLevel) -> Result<Vec<u8>, HandshakeError> {
    match &resolution.id_match {
        IdMatch::Share(share) => share.psk(level).ok_or(HandshakeError::NoKey(level)),
        IdMatch::Code { code, .. } => Ok(code.payload().to_vec()),
        IdMatch::Pending(pending) => Ok(pending.code().payload().to_vec()),
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn check_clock(ours: i64, theirs: i64) -> Result<(), HandshakeError> {
    let skew = (ours - theirs).abs();
    if skew > CLOCK_SKEW_MAX {
        return Err(HandshakeError::ClockSkew(skew));
    }
    Ok(())
}

fn unexpected(expected: &'static str, got: &Payload) -> HandshakeError {
    HandshakeError::Unexpected {
        expected,
        got: got.kind().to_string(),
    }
}

/// Run the accepting side of the handshake.
pub async fn incoming<T: Transport>(
    stream: T,
    shares: &Shares,
    config: &HandshakeConfig,
) -> Result<Authenticated<T>, HandshakeError> {
    let (wire_reader, wire_writer) = transport::wire_pair(stream);
    let mut reader = MessageReader::new(wire_reader);
    let mut writer = MessageWriter::new(wire_writer);

    writer
        .send(&Payload::Greeting {
            software: config.software.clone(),
            protocol: vec![PROTOCOL_VERSION],
            features: vec![],
        })
        .await?;

    let start = reader.read().await?.payload;
    let Payload::Start {
        protocol,
        id,
        access: their_access,
        peer: their_peer,
        ..
    } = start
    else {
        return Err(unexpected("start", &start));
    };
    if protocol != PROTOCOL_VERSION {
        writer.send(&Payload::CannotStart).await?;
        return Err(HandshakeError::NoCommonProtocol(vec![protocol]));
    }

    let resolution = match resolve(shares, &id) {
        Ok(resolution) => resolution,
        Err(e) => {
            writer.send(&Payload::CannotStart).await?;
            let _ = writer.shutdown().await;
            return Err(e);
        }
    };
    if their_peer == resolution.our_peer_id {
        return Err(HandshakeError::SelfConnection);
    }

    let level = resolution.our_access.greatest_common(their_access);
    writer
        .send(&Payload::Starttls {
            peer: resolution.our_peer_id.clone(),
            access: level,
        })
        .await?;

    let key = channel_key(&resolution, level)?;
    let (mut reader, mut writer) = establish_channel(reader, writer, &key, config).await?;

    let (share, access) =
        exchange_keys(resolution, level, &mut reader, &mut writer, shares, config).await?;
    let remote_name = exchange_identity(&mut reader, &mut writer, config).await?;

    finish(share, their_peer, remote_name, access, reader, writer)
}

/// Run the dialing side of the handshake for share or code `id`.
pub async fn outgoing<T: Transport>(
    stream: T,
    shares: &Shares,
    id: &str,
    config: &HandshakeConfig,
) -> Result<Authenticated<T>, HandshakeError> {
    let (wire_reader, wire_writer) = transport::wire_pair(stream);
    let mut reader = MessageReader::new(wire_reader);
    let mut writer = MessageWriter::new(wire_writer);

    let greeting = reader.read().await?.payload;
    let Payload::Greeting { protocol, .. } = greeting else {
        return Err(unexpected("greeting", &greeting));
    };
    if !protocol.contains(&PROTOCOL_VERSION) {
        return Err(HandshakeError::NoCommonProtocol(protocol));
    }

    let resolution = resolve(shares, id)?;
    writer
        .send(&Payload::Start {
            software: config.software.clone(),
            protocol: PROTOCOL_VERSION,
            features: vec![],
            id: id.to_string(),
            access: resolution.our_access,
            peer: resolution.our_peer_id.clone(),
        })
        .await?;

    let response = reader.read().await?.payload;
    let (their_peer, their_level) = match response {
        Payload::Starttls { peer, access } => (peer, access),
        Payload::CannotStart => return Err(HandshakeError::CannotStart),
        other => return Err(unexpected("starttls", &other)),
    };
    if their_peer == resolution.our_peer_id {
        return Err(HandshakeError::SelfConnection);
    }
    // The accepting side computed the greatest common level; never let it
    // grant us more than our own keys support.
    let level = resolution.our_access.greatest_common(their_level);

    let key = channel_key(&resolution, level)?;
    let (mut reader, mut writer) = establish_channel(reader, writer, &key, config).await?;

    let (share, access) =
        exchange_keys(resolution, level, &mut reader, &mut writer, shares, config).await?;
    let remote_name = exchange_identity(&mut reader, &mut writer, config).await?;

    finish(share, their_peer, remote_name, access, reader, writer)
}

fn finish<T: Transport>(
    share: Share,
    remote_peer_id: String,
    remote_name: Option<String>,
    access: AccessLevel,
    reader: MessageReader<T>,
    writer: MessageWriter<T>,
) -> Result<Authenticated<T>, HandshakeError> {
    {
        let peer = share.peer(&remote_peer_id);
        peer.lock().friendly_name = remote_name.clone();
    }
    tracing::info!(
        share = %share.id(),
        peer = %remote_peer_id,
        %access,
        "handshake complete"
    );
    Ok(Authenticated {
        share,
        remote_peer_id,
        remote_name,
        access,
        reader,
        writer,
    })
}

/// Upgrade to the encrypted channel, or run the plaintext key-possession
/// exchange when encryption is disabled.
async fn establish_channel<T: Transport>(
    reader: MessageReader<T>,
    writer: MessageWriter<T>,
    key: &[u8],
    config: &HandshakeConfig,
) -> Result<(MessageReader<T>, MessageWriter<T>), HandshakeError> {
    if config.encryption {
        let (wire_reader, wire_writer) =
            transport::upgrade(reader.into_wire(), writer.into_wire(), key).await?;
        return Ok((MessageReader::new(wire_reader), MessageWriter::new(wire_writer)));
    }

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    let mut reader = reader;
    let mut writer = writer;
    writer
        .send(&Payload::FakeTlsHandshake {
            key: BASE64.encode(key),
        })
        .await?;
    let proof = reader.read().await?.payload;
    let Payload::FakeTlsHandshake { key: their_key } = proof else {
        return Err(unexpected("fake_tls_handshake", &proof));
    };
    if BASE64.decode(their_key).as_deref() != Ok(key) {
        return Err(HandshakeError::KeyMismatch);
    }
    Ok((reader, writer))
}

/// The key exchange step. Share channels pass through; on a code channel
/// the share holder grants its full key set and the redeemer materializes
/// the share from it.
async fn exchange_keys<T: Transport>(
    resolution: Resolution,
    level: AccessLevel,
    reader: &mut MessageReader<T>,
    writer: &mut MessageWriter<T>,
    shares: &Shares,
    config: &HandshakeConfig,
) -> Result<(Share, AccessLevel), HandshakeError> {
    match resolution.id_match {
        IdMatch::Share(share) => Ok((share, level)),
        IdMatch::Code { share, code } => {
            // A holder can only grant what it has; the wire key set
            // carries no secrets above its own level.
            let granted = share.access_level();
            let (untrusted, read_only, read_write) = share.keyring().to_wire();
            writer
                .send(&Payload::Keys {
                    access: granted,
                    share_id: share.id().to_string(),
                    untrusted,
                    read_only,
                    read_write,
                })
                .await?;
            let ack = reader.read().await?.payload;
            if !matches!(ack, Payload::KeysAcknowledgment) {
                return Err(unexpected("keys_acknowledgment", &ack));
            }
            // Codes are single use; the secret has now been spent.
            share.delete_code(&code.id());
            tracing::info!(share = %share.id(), "access code redeemed, keys granted");
            Ok((share, granted))
        }
        IdMatch::Pending(pending) => {
            let keys = reader.read().await?.payload;
            let Payload::Keys {
                access,
                share_id,
                untrusted,
                read_only,
                read_write,
            } = keys
            else {
                return Err(unexpected("keys", &keys));
            };
            let ring = KeyRing::from_wire(&untrusted, &read_only, &read_write)?;
            std::fs::create_dir_all(pending.path())?;
            let store = (config.stores)(&share_id);
            let share = Share::from_keys(
                &share_id,
                pending.path(),
                pending.peer_id(),
                access,
                ring,
                store,
            )?;
            shares.insert(share.clone());
            shares.remove_pending(&pending.id());
            writer.send(&Payload::KeysAcknowledgment).await?;
            tracing::info!(share = %share.id(), "share materialized from access code");
            Ok((share, access))
        }
    }
}

/// Both sides announce a friendly name and their clock; intolerable skew
/// aborts the connection before any `utime` comparison can go wrong.
async fn exchange_identity<T: Transport>(
    reader: &mut MessageReader<T>,
    writer: &mut MessageWriter<T>,
    config: &HandshakeConfig,
) -> Result<Option<String>, HandshakeError> {
    writer
        .send(&Payload::Identity {
            name: config.friendly_name.clone(),
            time: now_secs(),
        })
        .await?;
    let identity = reader.read().await?.payload;
    let Payload::Identity { name, time } = identity else {
        return Err(unexpected("identity", &identity));
    };
    check_clock(now_secs(), time)?;
    Ok(if name.is_empty() { None } else { Some(name) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessCode, CodeKind};
    use crate::share::MemoryStore;

    fn config(name: &str) -> HandshakeConfig {
        HandshakeConfig::new("cirrus test", name)
    }

    fn share_on_both_nodes() -> (Shares, Shares, tempfile::TempDir, tempfile::TempDir) {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let share_a = Share::create(dir_a.path(), Arc::new(MemoryStore::new())).unwrap();
        let share_b = Share::from_keys(
            share_a.id(),
            dir_b.path(),
            "feedfacefeedfacefeedfacefeedface",
            AccessLevel::ReadWrite,
            share_a.keyring(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let shares_a = Shares::new();
        shares_a.insert(share_a);
        let shares_b = Shares::new();
        shares_b.insert(share_b);
        (shares_a, shares_b, dir_a, dir_b)
    }

    #[tokio::test]
    async fn share_to_share_over_encrypted_channel() {
        let (shares_a, shares_b, _da, _db) = share_on_both_nodes();
        let id = shares_a.all()[0].id().to_string();
        let (side_a, side_b) = tokio::io::duplex(64 * 1024);

        let cfg_a = config("alpha");
        let cfg_b = config("beta");
        let (accepted, dialed) = tokio::try_join!(
            incoming(side_a, &shares_a, &cfg_a),
            outgoing(side_b, &shares_b, &id, &cfg_b),
        )
        .unwrap();

        assert_eq!(accepted.access, AccessLevel::ReadWrite);
        assert_eq!(dialed.access, AccessLevel::ReadWrite);
        assert_eq!(accepted.remote_name.as_deref(), Some("beta"));
        assert_eq!(dialed.remote_name.as_deref(), Some("alpha"));
        assert_eq!(accepted.remote_peer_id, shares_b.all()[0].peer_id());
        assert_eq!(dialed.remote_peer_id, shares_a.all()[0].peer_id());
    }

    #[tokio::test]
    async fn plaintext_fallback_still_checks_key_possession() {
        let (shares_a, shares_b, _da, _db) = share_on_both_nodes();
        let id = shares_a.all()[0].id().to_string();
        let mut cfg_a = config("alpha");
        cfg_a.encryption = false;
        let mut cfg_b = config("beta");
        cfg_b.encryption = false;

        let (side_a, side_b) = tokio::io::duplex(64 * 1024);
        let result = tokio::try_join!(
            incoming(side_a, &shares_a, &cfg_a),
            outgoing(side_b, &shares_b, &id, &cfg_b),
        );
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unsupported_protocol_version_aborts_before_start() {
        let (shares_a, _shares_b, _da, _db) = share_on_both_nodes();
        let id = shares_a.all()[0].id().to_string();

        let (side_a, side_b) = tokio::io::duplex(64 * 1024);
        let greeter = tokio::spawn(async move {
            let (reader, writer) = transport::wire_pair(side_a);
            let mut writer = MessageWriter::new(writer);
            writer
                .send(&Payload::Greeting {
                    software: "future cirrus".into(),
                    protocol: vec![2, 3],
                    features: vec![],
                })
                .await
                .unwrap();
            // The dialer must hang up without ever sending start.
            let mut reader = MessageReader::new(reader);
            assert!(reader.read().await.is_err());
        });

        let result = outgoing(side_b, &shares_a, &id, &config("beta")).await;
        assert!(matches!(
            result,
            Err(HandshakeError::NoCommonProtocol(ref v)) if *v == vec![2, 3]
        ));
        greeter.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_id_gets_cannot_start() {
        let (shares_a, _shares_b, _da, _db) = share_on_both_nodes();
        let dir = tempfile::tempdir().unwrap();
        let stranger = Share::create(dir.path(), Arc::new(MemoryStore::new())).unwrap();
        let shares_c = Shares::new();
        shares_c.insert(stranger.clone());

        let (side_a, side_c) = tokio::io::duplex(64 * 1024);
        let cfg_a = config("alpha");
        let cfg_c = config("gamma");
        let (accept_result, dial_result) = tokio::join!(
            incoming(side_a, &shares_a, &cfg_a),
            outgoing(side_c, &shares_c, stranger.id(), &cfg_c),
        );
        assert!(matches!(accept_result, Err(HandshakeError::UnknownId(_))));
        assert!(matches!(dial_result, Err(HandshakeError::CannotStart)));
    }

    #[tokio::test]
    async fn wrong_key_fails_authentication() {
        let (shares_a, _shares_b, _da, _db) = share_on_both_nodes();
        let share_a = shares_a.all()[0].clone();

        // A node that knows the share id but holds different keys.
        let dir = tempfile::tempdir().unwrap();
        let impostor = Share::from_keys(
            share_a.id(),
            dir.path(),
            "badbadbadbadbadbadbadbadbadbadba",
            AccessLevel::ReadWrite,
            KeyRing::generate(),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        let shares_x = Shares::new();
        shares_x.insert(impostor);

        let (side_a, side_x) = tokio::io::duplex(64 * 1024);
        let cfg_a = config("alpha");
        let cfg_x = config("mallory");
        let (accept_result, dial_result) = tokio::join!(
            incoming(side_a, &shares_a, &cfg_a),
            outgoing(side_x, &shares_x, share_a.id(), &cfg_x),
        );
        assert!(accept_result.is_err());
        assert!(dial_result.is_err());
    }

    #[tokio::test]
    async fn access_code_redeems_into_a_share() {
        let dir_a = tempfile::tempdir().unwrap();
        let share_a = Share::create(dir_a.path(), Arc::new(MemoryStore::new())).unwrap();
        let code = AccessCode::create(CodeKind::Long);
        let code_id = code.id();
        share_a.add_code(code.clone());
        let shares_a = Shares::new();
        shares_a.insert(share_a.clone());

        let dir_b = tempfile::tempdir().unwrap();
        let shares_b = Shares::new();
        shares_b.add_pending(code, dir_b.path().join("joined"));

        let (side_a, side_b) = tokio::io::duplex(64 * 1024);
        let cfg_a = config("alpha");
        let cfg_b = config("beta");
        let (accepted, dialed) = tokio::try_join!(
            incoming(side_a, &shares_a, &cfg_a),
            outgoing(side_b, &shares_b, &code_id, &cfg_b),
        )
        .unwrap();

        assert_eq!(accepted.access, AccessLevel::ReadWrite);
        assert_eq!(dialed.access, AccessLevel::ReadWrite);
        // The redeemer now holds the share with identical keys.
        let joined = shares_b.get(share_a.id()).expect("share materialized");
        assert_eq!(
            joined.psk(AccessLevel::ReadWrite),
            share_a.psk(AccessLevel::ReadWrite)
        );
        // The code is spent on both sides.
        assert!(share_a.codes().is_empty());
        assert!(shares_b.pending().is_empty());
        assert!(shares_b.find_id(&code_id).is_none());
    }

    #[tokio::test]
    async fn read_only_holder_grants_only_read_only() {
        let dir_a = tempfile::tempdir().unwrap();
        let origin = Share::create(dir_a.path(), Arc::new(MemoryStore::new())).unwrap();

        // A holder whose read_write tier is verify-only, as a read_only
        // grant would leave it.
        let (untrusted, read_only, mut read_write) = origin.keyring().to_wire();
        read_write.signing = None;
        read_write.verify = Some(hex::encode(
            origin
                .keyring()
                .verifying_key(AccessLevel::ReadWrite)
                .unwrap()
                .to_bytes(),
        ));
        let ring = KeyRing::from_wire(&untrusted, &read_only, &read_write).unwrap();
        let dir_h = tempfile::tempdir().unwrap();
        let holder = Share::from_keys(
            origin.id(),
            dir_h.path(),
            "d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0d0",
            AccessLevel::ReadOnly,
            ring,
            Arc::new(MemoryStore::new()),
        )
        .unwrap();

        let code = AccessCode::create(CodeKind::Long);
        let code_id = code.id();
        holder.add_code(code.clone());
        let shares_h = Shares::new();
        shares_h.insert(holder);

        let dir_b = tempfile::tempdir().unwrap();
        let shares_b = Shares::new();
        shares_b.add_pending(code, dir_b.path().join("joined"));

        let (side_h, side_b) = tokio::io::duplex(64 * 1024);
        let cfg_h = config("holder");
        let cfg_b = config("beta");
        let (accepted, dialed) = tokio::try_join!(
            incoming(side_h, &shares_h, &cfg_h),
            outgoing(side_b, &shares_b, &code_id, &cfg_b),
        )
        .unwrap();

        assert_eq!(accepted.access, AccessLevel::ReadOnly);
        assert_eq!(dialed.access, AccessLevel::ReadOnly);
        let joined = shares_b.get(origin.id()).expect("share materialized");
        assert_eq!(joined.access_level(), AccessLevel::ReadOnly);
        // The redeemer cannot have gained a signing key the holder lacks.
        assert!(joined.signing_key(AccessLevel::ReadWrite).is_none());
    }

    #[test]
    fn clock_skew_limits() {
        assert!(check_clock(1000, 1000 + CLOCK_SKEW_MAX).is_ok());
        assert!(check_clock(1000, 1000 - CLOCK_SKEW_MAX).is_ok());
        assert!(matches!(
            check_clock(1000, 1000 + CLOCK_SKEW_MAX + 1),
            Err(HandshakeError::ClockSkew(_))
        ));
    }
}
