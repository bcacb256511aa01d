// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic, field-ordered persistence codec ("pickling").
//!
//! Every pickled value is the plain concatenation of its field encodings in a fixed order, so
//! round-trips are byte-exact and the length of a pickle can be computed without producing it.
//! Integers are big-endian fixed-width; decoding runs against a bounded cursor and fails when
//! it would overrun.
use thiserror::Error;

use crate::crypto::x25519::{KeyPair, PublicKey, SecretKey, KEY_SIZE};
use crate::crypto::SecretBytes;

pub(crate) trait Pickle {
    fn pickle_length(&self) -> usize;

    fn pickle(&self, buffer: &mut Vec<u8>);
}

pub(crate) trait Unpickle: Sized {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError>;
}

pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn take(&mut self, length: usize) -> Result<&'a [u8], PickleError> {
        if self.bytes.len() < length {
            return Err(PickleError::Truncated);
        }
        let (taken, rest) = self.bytes.split_at(length);
        self.bytes = rest;
        Ok(taken)
    }

    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        Ok(self
            .take(N)?
            .try_into()
            .expect("taken slice has requested length"))
    }
}

impl Pickle for bool {
    fn pickle_length(&self) -> usize {
        1
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        buffer.push(u8::from(*self));
    }
}

impl Unpickle for bool {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        match cursor.take_array::<1>()?[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(PickleError::Invalid),
        }
    }
}

impl Pickle for u32 {
    fn pickle_length(&self) -> usize {
        4
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_be_bytes());
    }
}

impl Unpickle for u32 {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        Ok(u32::from_be_bytes(cursor.take_array()?))
    }
}

impl Pickle for PublicKey {
    fn pickle_length(&self) -> usize {
        KEY_SIZE
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self.as_bytes());
    }
}

impl Unpickle for PublicKey {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        Ok(PublicKey::from_bytes(cursor.take_array()?))
    }
}

impl<const N: usize> Pickle for SecretBytes<N> {
    fn pickle_length(&self) -> usize {
        N
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self.as_bytes());
    }
}

impl<const N: usize> Unpickle for SecretBytes<N> {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        Ok(SecretBytes::from_bytes(cursor.take_array()?))
    }
}

// Key pairs store both halves; the secret scalar is already clamped, so reconstruction does not
// need to touch the curve.
impl Pickle for KeyPair {
    fn pickle_length(&self) -> usize {
        2 * KEY_SIZE
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(self.public_key().as_bytes());
        buffer.extend_from_slice(self.secret().as_bytes());
    }
}

impl Unpickle for KeyPair {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        let public = PublicKey::from_bytes(cursor.take_array()?);
        let secret = SecretKey::from_bytes(cursor.take_array()?);
        Ok(KeyPair::from_parts(secret, public))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PickleError {
    #[error("unexpected end of pickled data")]
    Truncated,

    #[error("pickled data contains an invalid value")]
    Invalid,
}

#[cfg(test)]
mod tests {
    use crate::crypto::x25519::PublicKey;

    use super::{Cursor, Pickle, PickleError, Unpickle};

    #[test]
    fn primitive_round_trips() {
        let mut buffer = Vec::new();
        true.pickle(&mut buffer);
        false.pickle(&mut buffer);
        0xDEAD_BEEFu32.pickle(&mut buffer);
        PublicKey::from_bytes([9; 32]).pickle(&mut buffer);
        assert_eq!(buffer.len(), 1 + 1 + 4 + 32);

        let mut cursor = Cursor::new(&buffer);
        assert!(bool::unpickle(&mut cursor).unwrap());
        assert!(!bool::unpickle(&mut cursor).unwrap());
        assert_eq!(u32::unpickle(&mut cursor).unwrap(), 0xDEAD_BEEF);
        assert_eq!(
            PublicKey::unpickle(&mut cursor).unwrap(),
            PublicKey::from_bytes([9; 32])
        );
    }

    #[test]
    fn truncated_input_fails() {
        let mut cursor = Cursor::new(&[0, 1, 2]);
        assert_eq!(u32::unpickle(&mut cursor), Err(PickleError::Truncated));
    }

    #[test]
    fn invalid_bool_fails() {
        let mut cursor = Cursor::new(&[2]);
        assert_eq!(bool::unpickle(&mut cursor), Err(PickleError::Invalid));
    }
}
