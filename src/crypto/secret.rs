// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use zeroize::ZeroizeOnDrop;

/// Fixed-width secret key material: root keys, chain keys, message keys and the cipher keys
/// derived from them.
///
/// The bytes are wiped from memory when the value drops, and they never appear in `Debug`
/// output. Both accessors are crate-private, so key material cannot escape through the public
/// API; everything a host may persist goes through the pickle codec instead.
#[derive(Clone, ZeroizeOnDrop)]
pub(crate) struct SecretBytes<const N: usize>([u8; N]);

impl<const N: usize> SecretBytes<N> {
    pub(crate) fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(redacted)")
    }
}
