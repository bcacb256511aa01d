// SPDX-License-Identifier: MIT OR Apache-2.0

//! HKDF-SHA256, the key derivation step behind every secret this crate mints.
//!
//! Three derivation contexts exist, told apart by their info strings: `"OLM_ROOT"` turns the
//! 96-byte handshake secret into the initial root and chain keys, `"OLM_RATCHET"` folds a
//! Diffie-Hellman output into the current root key on each ratchet step (the root key acts as
//! the salt), and `"OLM_KEYS"` expands one message key into the cipher's AES key, MAC key and
//! IV.
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

pub fn hkdf_sha256<const N: usize>(
    salt: &[u8],
    input_key_material: &[u8],
    info: &[u8],
) -> Result<[u8; N], KdfError> {
    let salt = (!salt.is_empty()).then_some(salt);
    let mut output = [0u8; N];
    Hkdf::<Sha256>::new(salt, input_key_material)
        .expand(info, &mut output)
        .map_err(|_| KdfError::OutputTooLong)?;
    Ok(output)
}

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("requested more key material than hkdf can produce")]
    OutputTooLong,
}
