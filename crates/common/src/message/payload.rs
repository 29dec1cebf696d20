//! The protocol message vocabulary.
//!
//! One JSON object per message, discriminated by its `type` field. The enum
//! is internally tagged so serde produces exactly the wire shape, and the
//! receive loop's `match` is compile-checked exhaustive: a new message type
//! cannot be added without deciding how every session handles it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;

/// A `(start, length)` byte range within a file.
pub type ByteRange = (u64, u64);

/// One protocol message's JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// First message on any connection, sent by the accepting side.
    Greeting {
        software: String,
        protocol: Vec<u32>,
        #[serde(default)]
        features: Vec<String>,
    },
    /// The dialing side declares which share (or code) it wants to talk
    /// about and at what access level.
    Start {
        software: String,
        protocol: u32,
        #[serde(default)]
        features: Vec<String>,
        id: String,
        access: AccessLevel,
        peer: String,
    },
    /// The accepting side does not know the requested id.
    CannotStart,
    /// The accepting side's identity and the negotiated access level.
    Starttls { peer: String, access: AccessLevel },
    /// Plaintext PSK possession proof, for test harnesses with encryption
    /// explicitly disabled. Never sent in normal operation.
    FakeTlsHandshake { key: String },
    /// Full key material, sent over the encrypted channel to upgrade an
    /// access code into a share.
    Keys {
        access: AccessLevel,
        share_id: String,
        untrusted: KeySet,
        read_only: KeySet,
        read_write: KeySet,
    },
    KeysAcknowledgment,
    /// Friendly name and clock exchange; both sides send one.
    Identity { name: String, time: i64 },
    GetManifest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<f64>,
    },
    ManifestCurrent,
    Manifest {
        peer: String,
        version: f64,
        files: Vec<FileEntry>,
    },
    Update {
        file: FileEntry,
    },
    /// Rename notification. Reserved; receiving one is an explicit error.
    Move {
        from: String,
        to: String,
        utime: f64,
    },
    Get {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<ByteRange>,
    },
    /// Header for a chunked binary payload carrying file contents.
    FileData {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<ByteRange>,
    },
    /// Keepalive; `timeout` is the sender's minimum acceptable interval in
    /// seconds.
    Ping { timeout: u64 },
}

impl Payload {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Greeting { .. } => "greeting",
            Payload::Start { .. } => "start",
            Payload::CannotStart => "cannot_start",
            Payload::Starttls { .. } => "starttls",
            Payload::FakeTlsHandshake { .. } => "fake_tls_handshake",
            Payload::Keys { .. } => "keys",
            Payload::KeysAcknowledgment => "keys_acknowledgment",
            Payload::Identity { .. } => "identity",
            Payload::GetManifest { .. } => "get_manifest",
            Payload::ManifestCurrent => "manifest_current",
            Payload::Manifest { .. } => "manifest",
            Payload::Update { .. } => "update",
            Payload::Move { .. } => "move",
            Payload::Get { .. } => "get",
            Payload::FileData { .. } => "file_data",
            Payload::Ping { .. } => "ping",
        }
    }
}

/// Keys for one access tier inside a `keys` message. All hex-encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    /// ed25519 seed; present when the tier's private half is being granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing: Option<String>,
    /// ed25519 public key; present when only verification is granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
}

/// One file's metadata as it appears in `manifest` and `update` messages.
///
/// Tombstones carry only `path`, `utime`, `id` and `deleted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// Logical update clock; strictly increasing per path.
    pub utime: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Seconds and nanosecond remainder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<(i64, u32)>,
    /// Octal permission string, e.g. "100644".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

// Compact debug rendering: long hex strings (hashes, ids) are shortened so
// log lines stay legible. Not part of the wire contract.
fn looks_like_hex(s: &str) -> bool {
    s.len() >= 16 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

fn value_to_str(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) if looks_like_hex(s) => {
            out.push('"');
            out.push_str(&s[..8]);
            out.push_str("...\"");
        }
        serde_json::Value::Object(map) => {
            out.push_str("{ ");
            let mut first = true;
            for (key, val) in map {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                out.push_str(key);
                out.push_str(": ");
                value_to_str(val, out);
            }
            out.push_str(" }");
        }
        serde_json::Value::Array(items) => {
            out.push_str("[ ");
            let mut first = true;
            for val in items {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                value_to_str(val, out);
            }
            out.push_str(" ]");
        }
        other => out.push_str(&other.to_string()),
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.kind().to_uppercase();
        if let Ok(serde_json::Value::Object(mut map)) = serde_json::to_value(self) {
            map.remove("type");
            if !map.is_empty() {
                out.push(' ');
                value_to_str(&serde_json::Value::Object(map), &mut out);
            }
        }
        write!(f, "{out}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serialization() {
        let payload = Payload::GetManifest { version: Some(1.5) };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"type":"get_manifest","version":1.5}"#);

        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn version_absent_when_none() {
        let json = serde_json::to_string(&Payload::GetManifest { version: None }).unwrap();
        assert_eq!(json, r#"{"type":"get_manifest"}"#);
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = serde_json::from_str::<Payload>(r#"{"type":"teleport"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn display_shortens_hashes() {
        let payload = Payload::Get {
            path: "docs/readme.md".into(),
            range: None,
        };
        assert_eq!(payload.to_string(), r#"GET { path: "docs/readme.md" }"#);

        let entry = FileEntry {
            path: "a.txt".into(),
            utime: 100.0,
            size: Some(4),
            mtime: Some((1700000000, 0)),
            mode: Some("100644".into()),
            sha256: Some("0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef".into()),
            id: None,
            key: None,
            deleted: false,
        };
        let rendered = Payload::Update { file: entry }.to_string();
        assert!(rendered.contains("\"01234567...\""), "got: {rendered}");
    }

    #[test]
    fn tombstone_entry_skips_content_fields() {
        let entry = FileEntry {
            path: "gone.txt".into(),
            utime: 7.0,
            size: None,
            mtime: None,
            mode: None,
            sha256: None,
            id: Some("ab".into()),
            key: None,
            deleted: true,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"path":"gone.txt","utime":7.0,"id":"ab","deleted":true}"#);
    }
}
