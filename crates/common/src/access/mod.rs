//! Access descriptors: the credentials a node presents for a share.
//!
//! Two text formats exist, both Base32 with a Luhn mod 32 check character
//! and a magic-byte version discriminator:
//!
//! - **Long codes** (`CLEARSKIES...`, 37 chars, 16-byte payload) bootstrap a
//!   full share: the payload is handed out out-of-band and upgraded into a
//!   complete key set during the handshake's key exchange.
//! - **Short codes** (`SYNC...`, 17 chars, 7-byte payload) are the compact
//!   single-use variant.
//!
//! A code's `id()` is the SHA-256 of its payload; peers holding the same
//! secret rendezvous on the id without revealing the secret itself.

pub mod base32;
pub mod luhn;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors from parsing or rendering access codes.
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("invalid character in base32: {0:?}")]
    InvalidCharacter(char),
    #[error("invalid value for base32: {0}")]
    InvalidValue(u8),
    #[error("base32 needs a byte length divisible by 5, got {0}")]
    BadEncodeLength(usize),
    #[error("wrong length for an access code: {0} characters")]
    WrongLength(usize),
    #[error("fails Luhn mod 32 check")]
    ChecksumMismatch,
    #[error("missing access code prefix")]
    BadPrefix,
    #[error("access code has wrong magic bytes")]
    BadMagic,
}

/// Privilege tiers, ordered. Negotiation takes the minimum of what each
/// side holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Unknown,
    Untrusted,
    ReadOnly,
    ReadWrite,
}

impl AccessLevel {
    /// Most-privileged level shared by both peers.
    pub fn greatest_common(self, other: AccessLevel) -> AccessLevel {
        self.min(other)
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessLevel::Unknown => "unknown",
            AccessLevel::Untrusted => "untrusted",
            AccessLevel::ReadOnly => "read_only",
            AccessLevel::ReadWrite => "read_write",
        };
        write!(f, "{name}")
    }
}

/// Which text family a code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// 7-byte payload, rendered as `SYNC...` (17 characters).
    Short,
    /// 16-byte payload, rendered as `CLEARSKIES...` (37 characters).
    Long,
}

// Magic bytes are chosen so the base32 rendering spells out the prefix.
const LONG_MAGIC: [u8; 4] = [0x8c, 0x94, 0x82, 0x48];
const LONG_ASCII_PREFIX: &str = "CLEA";
const LONG_TEXT_LEN: usize = 37;

const SHORT_MAGIC: [u8; 3] = [0x96, 0x1a, 0x20];
const SHORT_TEXT_LEN: usize = 17;

/// A share credential: random payload plus derived rendezvous id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCode {
    kind: CodeKind,
    payload: Vec<u8>,
}

impl AccessCode {
    /// Generate a fresh code of the given kind.
    pub fn create(kind: CodeKind) -> Self {
        let len = match kind {
            CodeKind::Short => 7,
            CodeKind::Long => 16,
        };
        let mut payload = vec![0u8; len];
        getrandom::getrandom(&mut payload).expect("failed to generate random bytes");
        Self { kind, payload }
    }

    /// Reconstruct a code from a raw payload (as received in key exchange).
    pub fn from_payload(kind: CodeKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Parse the textual form, verifying length, prefix, check character
    /// and magic bytes.
    pub fn parse(text: &str) -> Result<Self, CodeError> {
        let text = text.trim();
        match text.len() {
            LONG_TEXT_LEN => {
                if !text.to_uppercase().starts_with("CLEARSKIES") {
                    return Err(CodeError::BadPrefix);
                }
                let unchecked = luhn::verify(text)?;
                let body = &unchecked[LONG_ASCII_PREFIX.len()..];
                let binary = base32::decode(body)?;
                if binary.len() != 20 || binary[..4] != LONG_MAGIC {
                    return Err(CodeError::BadMagic);
                }
                Ok(Self {
                    kind: CodeKind::Long,
                    payload: binary[4..].to_vec(),
                })
            }
            SHORT_TEXT_LEN => {
                if !text.to_uppercase().starts_with("SYNC") {
                    return Err(CodeError::BadPrefix);
                }
                let unchecked = luhn::verify(text)?;
                let binary = base32::decode(unchecked)?;
                if binary.len() != 10 || binary[..3] != SHORT_MAGIC {
                    return Err(CodeError::BadMagic);
                }
                Ok(Self {
                    kind: CodeKind::Short,
                    payload: binary[3..].to_vec(),
                })
            }
            other => Err(CodeError::WrongLength(other)),
        }
    }

    /// SHA-256 hex of the payload, used as the rendezvous id.
    pub fn id(&self) -> String {
        hex::encode(Sha256::digest(&self.payload))
    }

    pub fn kind(&self) -> CodeKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// A bare code grants nothing until key exchange upgrades it.
    pub fn access_level(&self) -> AccessLevel {
        AccessLevel::Unknown
    }

    fn render(&self) -> Result<String, CodeError> {
        match self.kind {
            CodeKind::Long => {
                let mut binary = LONG_MAGIC.to_vec();
                binary.extend_from_slice(&self.payload);
                luhn::generate(&format!("{LONG_ASCII_PREFIX}{}", base32::encode(&binary)?))
            }
            CodeKind::Short => {
                let mut binary = SHORT_MAGIC.to_vec();
                binary.extend_from_slice(&self.payload);
                luhn::generate(&base32::encode(&binary)?)
            }
        }
    }
}

impl fmt::Display for AccessCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payload lengths are fixed by construction, so rendering cannot fail.
        write!(f, "{}", self.render().map_err(|_| fmt::Error)?)
    }
}

/// An access code for a share we did not create: entered by the user and
/// held until a peer performs the key exchange that materializes the share.
#[derive(Debug, Clone)]
pub struct PendingCode {
    code: AccessCode,
    /// Our identity within the share-to-be.
    peer_id: String,
    /// Where the share will live locally once keys arrive.
    path: PathBuf,
}

impl PendingCode {
    pub fn new(code: AccessCode, path: PathBuf) -> Self {
        let mut raw = [0u8; 16];
        getrandom::getrandom(&mut raw).expect("failed to generate random bytes");
        Self {
            code,
            peer_id: hex::encode(raw),
            path,
        }
    }

    pub fn code(&self) -> &AccessCode {
        &self.code
    }

    pub fn id(&self) -> String {
        self.code.id()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_code_round_trip() {
        let code = AccessCode::create(CodeKind::Long);
        let text = code.to_string();
        assert_eq!(text.len(), LONG_TEXT_LEN);
        assert!(text.starts_with("CLEARSKIES"), "got {text}");
        let parsed = AccessCode::parse(&text).unwrap();
        assert_eq!(parsed.payload(), code.payload());
        assert_eq!(parsed.id(), code.id());
    }

    #[test]
    fn short_code_round_trip() {
        let code = AccessCode::create(CodeKind::Short);
        let text = code.to_string();
        assert_eq!(text.len(), SHORT_TEXT_LEN);
        assert!(text.starts_with("SYNC"), "got {text}");
        let parsed = AccessCode::parse(&text).unwrap();
        assert_eq!(parsed.payload(), code.payload());
    }

    #[test]
    fn corrupted_character_fails() {
        let code = AccessCode::create(CodeKind::Long);
        let text = code.to_string();
        // Flip a payload character (past the fixed prefix).
        let mut chars: Vec<char> = text.chars().collect();
        let pos = 20;
        chars[pos] = if chars[pos] == 'A' { 'B' } else { 'A' };
        let corrupted: String = chars.into_iter().collect();
        assert!(AccessCode::parse(&corrupted).is_err());
    }

    #[test]
    fn multibyte_tail_fails_cleanly() {
        // 37 bytes, so it passes the length gate, but the final character
        // is not a char boundary for the check-digit slice.
        let mut text = "CLEARSKIES".to_string();
        text.push_str(&"A".repeat(25));
        text.push('é');
        assert_eq!(text.len(), LONG_TEXT_LEN);
        assert!(matches!(
            AccessCode::parse(&text),
            Err(CodeError::InvalidCharacter('é'))
        ));
    }

    #[test]
    fn truncated_code_fails() {
        let code = AccessCode::create(CodeKind::Long);
        let text = code.to_string();
        assert!(matches!(
            AccessCode::parse(&text[..text.len() - 1]),
            Err(CodeError::WrongLength(36))
        ));
    }

    #[test]
    fn bare_code_grants_nothing() {
        let code = AccessCode::create(CodeKind::Short);
        assert_eq!(code.access_level(), AccessLevel::Unknown);
    }

    #[test]
    fn level_ordering() {
        use AccessLevel::*;
        assert!(Unknown < Untrusted);
        assert!(Untrusted < ReadOnly);
        assert!(ReadOnly < ReadWrite);
        assert_eq!(ReadWrite.greatest_common(ReadOnly), ReadOnly);
        assert_eq!(Unknown.greatest_common(ReadWrite), Unknown);
    }

    #[test]
    fn pending_code_has_own_peer_id() {
        let code = AccessCode::create(CodeKind::Long);
        let a = PendingCode::new(code.clone(), PathBuf::from("/tmp/a"));
        let b = PendingCode::new(code, PathBuf::from("/tmp/b"));
        assert_ne!(a.peer_id(), b.peer_id());
        assert_eq!(a.peer_id().len(), 32);
    }
}
