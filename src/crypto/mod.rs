// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic building blocks of the session protocol:
//!
//! - X25519 key agreement for the handshake and the ratchet steps
//! - HKDF-SHA256 key derivation under the three protocol info strings
//! - the AES-256-CBC + truncated HMAC-SHA256 message cipher
//! - a ChaCha20 randomness source for hosts that do not bring their own
pub mod cipher;
pub mod hkdf;
mod rng;
mod secret;
pub mod x25519;

pub use rng::{Rng, RngError};
pub(crate) use secret::SecretBytes;
