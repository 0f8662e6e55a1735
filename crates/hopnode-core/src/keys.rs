//! Tunnel Key Management
//!
//! X25519 key generation for tunnel peers. Private scalars are clamped
//! before storage so the stored bytes are exactly the scalar used for
//! the base point multiplication.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{X25519_BASEPOINT_BYTES, x25519};
use std::fmt;

/// Length of every tunnel key in bytes
pub const KEY_LEN: usize = 32;

/// Clamp a raw scalar per the Curve25519 convention
pub fn clamp_scalar(mut bytes: [u8; KEY_LEN]) -> [u8; KEY_LEN] {
    bytes[0] &= 0b1111_1000;
    bytes[31] &= 0b0111_1111;
    bytes[31] |= 0b0100_0000;
    bytes
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = BASE64.decode(s.trim())
        .map_err(|_| KeyError::InvalidBase64)?;

    if bytes.len() != KEY_LEN {
        return Err(KeyError::InvalidLength);
    }

    let mut arr = [0u8; KEY_LEN];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Tunnel private key (clamped Curve25519 scalar)
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    scalar: [u8; KEY_LEN],
}

impl PrivateKey {
    /// Generate a new random, clamped private key
    pub fn generate() -> Self {
        let mut raw = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut raw);
        Self::from_bytes(raw)
    }

    /// Create from raw bytes (clamping is applied)
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            scalar: clamp_scalar(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Derive the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            bytes: x25519(self.scalar, X25519_BASEPOINT_BYTES),
        }
    }

    /// Get raw (clamped) bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.scalar
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.scalar)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// Tunnel public key (Curve25519 u-coordinate)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey {
    bytes: [u8; KEY_LEN],
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.bytes
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// Optional symmetric key mixed into the tunnel handshake
#[derive(Clone, PartialEq, Eq)]
pub struct PresharedKey {
    bytes: [u8; KEY_LEN],
}

impl PresharedKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(|bytes| Self { bytes })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresharedKey([redacted])")
    }
}

/// A key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Key parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,
}
