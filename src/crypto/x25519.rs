// SPDX-License-Identifier: MIT OR Apache-2.0

//! Curve25519 key types and the X25519 shared-secret operation the handshake and ratchet are
//! built on.
use std::fmt;

use libcrux::ecdh;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

/// Scalars, curve points and Diffie-Hellman outputs are all 32 bytes wide.
pub const KEY_SIZE: usize = 32;

/// Clamps 32 seed bytes into a Curve25519 scalar: clear the low three bits, clear the top bit,
/// set the second-highest bit.
fn clamp(mut scalar: [u8; KEY_SIZE]) -> [u8; KEY_SIZE] {
    scalar[0] &= 0b1111_1000;
    scalar[KEY_SIZE - 1] &= 0b0111_1111;
    scalar[KEY_SIZE - 1] |= 0b0100_0000;
    scalar
}

/// Curve25519 point, as exchanged on the wire for identity, base, one-time and ratchet keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Curve25519 secret scalar, clamped on construction and wiped on drop.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Turns 32 bytes of seed entropy into a scalar. Clamping is idempotent, so feeding a
    /// stored scalar back through here leaves it unchanged.
    pub fn from_bytes(seed: [u8; KEY_SIZE]) -> Self {
        Self(clamp(seed))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// The matching curve point, derived by base-point multiplication.
    pub fn public_key(&self) -> Result<PublicKey, X25519Error> {
        let point = ecdh::secret_to_public(ecdh::Algorithm::X25519, self.0)
            .map_err(|_| X25519Error::BadPoint)?;
        Ok(PublicKey(
            point.try_into().expect("x25519 points are 32 bytes"),
        ))
    }

    /// X25519: the Diffie-Hellman secret this scalar shares with the peer's point.
    pub fn shared_secret(&self, their_key: &PublicKey) -> Result<[u8; KEY_SIZE], X25519Error> {
        let secret = ecdh::derive(ecdh::Algorithm::X25519, their_key.as_bytes(), self.0)
            .map_err(|_| X25519Error::BadPoint)?;
        Ok(secret.try_into().expect("x25519 outputs are 32 bytes"))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(redacted)")
    }
}

/// Secret scalar together with its cached public point.
///
/// Identity, base, one-time and ratchet keys are all generated this way, from 32 bytes of
/// caller-supplied entropy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn from_seed(seed: [u8; KEY_SIZE]) -> Result<Self, X25519Error> {
        let secret = SecretKey::from_bytes(seed);
        let public = secret.public_key()?;
        Ok(Self { secret, public })
    }

    pub(crate) fn from_parts(secret: SecretKey, public: PublicKey) -> Self {
        Self { secret, public }
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }
}

#[derive(Debug, Error)]
pub enum X25519Error {
    #[error("public key is not a usable curve point")]
    BadPoint,
}
