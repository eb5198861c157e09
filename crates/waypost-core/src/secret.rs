//! Secret primitives for waypost.
//!
//! Provides two things:
//!   1. Constant-time comparison for client-presented secrets
//!   2. The rotating pre-shared key handed to clients after a handshake
//!
//! PSK material derives ZeroizeOnDrop and never appears in Debug output.
//! Logs refer to a key only through its BLAKE3 fingerprint.

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Compare two secrets without an early exit on the first differing byte.
///
/// The cost depends only on the input length, never on where a mismatch
/// occurs. Inputs of different length compare unequal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Short, non-reversible tag for a secret, safe to put in logs.
pub fn fingerprint(secret: &[u8]) -> String {
    hex::encode(&blake3::hash(secret).as_bytes()[..4])
}

/// Fill `len` random bytes and return them hex-encoded.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    let encoded = hex::encode(&bytes);
    bytes.zeroize();
    encoded
}

/// A pre-shared key for the tunnel transport, hex-encoded.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Psk(String);

impl Psk {
    /// Generate a fresh key of `len_bytes` random bytes.
    pub fn generate(len_bytes: usize) -> Self {
        Self(random_hex(len_bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.0.as_bytes())
    }
}

impl PartialEq for Psk {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(self.0.as_bytes(), other.0.as_bytes())
    }
}

impl Eq for Psk {}

impl std::fmt::Debug for Psk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Psk({})", self.fingerprint())
    }
}
