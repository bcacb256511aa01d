// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message cipher: AES-256-CBC with PKCS#7 padding, authenticated by a truncated HMAC-SHA256
//! tag over the full message.
//!
//! All key material is derived per message key, so a cipher instance is only ever used for a
//! single message.
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::hkdf::{hkdf_sha256, KdfError};
use crate::crypto::SecretBytes;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const MESSAGE_CIPHER_KDF_INFO: &[u8] = b"OLM_KEYS";

pub const MESSAGE_KEY_SIZE: usize = 32;

/// Length of the truncated HMAC-SHA256 tag appended to every message.
pub const MAC_LENGTH: usize = 8;

const AES_KEY_SIZE: usize = 32;
const MAC_KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;
const AES_BLOCK_SIZE: usize = 16;

/// Ciphertext length for a given plaintext length. PKCS#7 always pads, so the result is the
/// next multiple of the block size above the plaintext length.
pub(crate) fn ciphertext_length(plaintext_length: usize) -> usize {
    plaintext_length + AES_BLOCK_SIZE - (plaintext_length % AES_BLOCK_SIZE)
}

/// Single-use cipher holding the AES key, MAC key and IV derived from one message key.
pub(crate) struct MessageCipher {
    aes_key: SecretBytes<AES_KEY_SIZE>,
    mac_key: SecretBytes<MAC_KEY_SIZE>,
    iv: SecretBytes<IV_SIZE>,
}

impl MessageCipher {
    pub fn new(message_key: &SecretBytes<MESSAGE_KEY_SIZE>) -> Result<Self, CipherError> {
        let derived = Zeroizing::new(hkdf_sha256::<{ AES_KEY_SIZE + MAC_KEY_SIZE + IV_SIZE }>(
            b"",
            message_key.as_bytes(),
            MESSAGE_CIPHER_KDF_INFO,
        )?);

        Ok(Self {
            aes_key: SecretBytes::from_bytes(
                derived[..AES_KEY_SIZE]
                    .try_into()
                    .expect("aes key slice has fixed length"),
            ),
            mac_key: SecretBytes::from_bytes(
                derived[AES_KEY_SIZE..AES_KEY_SIZE + MAC_KEY_SIZE]
                    .try_into()
                    .expect("mac key slice has fixed length"),
            ),
            iv: SecretBytes::from_bytes(
                derived[AES_KEY_SIZE + MAC_KEY_SIZE..]
                    .try_into()
                    .expect("iv slice has fixed length"),
            ),
        })
    }

    /// Encrypts into the given buffer, which must hold exactly
    /// [`ciphertext_length`] bytes for this plaintext.
    pub fn encrypt(&self, plaintext: &[u8], ciphertext: &mut [u8]) -> Result<(), CipherError> {
        let encrypted = Aes256CbcEnc::new(self.aes_key.as_bytes().into(), self.iv.as_bytes().into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        if ciphertext.len() != encrypted.len() {
            return Err(CipherError::OutputBufferTooSmall);
        }
        ciphertext.copy_from_slice(&encrypted);

        Ok(())
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let plaintext = Aes256CbcDec::new(self.aes_key.as_bytes().into(), self.iv.as_bytes().into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CipherError::BadPadding)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Truncated authentication tag over the complete message up to the tag itself.
    pub fn mac(&self, message: &[u8]) -> [u8; MAC_LENGTH] {
        let mut mac = HmacSha256::new_from_slice(self.mac_key.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(message);
        let tag = mac.finalize().into_bytes();
        tag[..MAC_LENGTH]
            .try_into()
            .expect("tag is longer than its truncation")
    }

    pub fn verify_mac(&self, message: &[u8], tag: &[u8]) -> Result<(), CipherError> {
        let expected = self.mac(message);
        if bool::from(tag.ct_eq(&expected)) {
            Ok(())
        } else {
            Err(CipherError::BadMac)
        }
    }
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error(transparent)]
    Kdf(#[from] KdfError),

    #[error("message authentication failed")]
    BadMac,

    #[error("invalid ciphertext padding")]
    BadPadding,

    #[error("output buffer too small for ciphertext")]
    OutputBufferTooSmall,
}

#[cfg(test)]
mod tests {
    use crate::crypto::{Rng, SecretBytes};

    use super::{ciphertext_length, MessageCipher, AES_BLOCK_SIZE};

    #[test]
    fn padded_ciphertext_length() {
        assert_eq!(ciphertext_length(0), AES_BLOCK_SIZE);
        assert_eq!(ciphertext_length(1), AES_BLOCK_SIZE);
        assert_eq!(ciphertext_length(15), AES_BLOCK_SIZE);
        assert_eq!(ciphertext_length(16), 2 * AES_BLOCK_SIZE);
        assert_eq!(ciphertext_length(17), 2 * AES_BLOCK_SIZE);
    }

    #[test]
    fn encrypt_decrypt() {
        let rng = Rng::from_seed([1; 32]);

        let message_key = SecretBytes::from_bytes(rng.random_array().unwrap());
        let cipher = MessageCipher::new(&message_key).unwrap();

        let mut ciphertext = vec![0u8; ciphertext_length(13)];
        cipher.encrypt(b"Hello, Alice!", &mut ciphertext).unwrap();

        let plaintext = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(&plaintext[..], b"Hello, Alice!");
    }

    #[test]
    fn mac_verification() {
        let rng = Rng::from_seed([2; 32]);

        let message_key = SecretBytes::from_bytes(rng.random_array().unwrap());
        let cipher = MessageCipher::new(&message_key).unwrap();

        let tag = cipher.mac(b"some wire bytes");
        assert!(cipher.verify_mac(b"some wire bytes", &tag).is_ok());
        assert!(cipher.verify_mac(b"other wire bytes", &tag).is_err());

        let mut tampered = tag;
        tampered[0] ^= 1;
        assert!(cipher.verify_mac(b"some wire bytes", &tampered).is_err());
    }

    #[test]
    fn different_message_keys_do_not_decrypt() {
        let rng = Rng::from_seed([3; 32]);

        let message_key = SecretBytes::from_bytes(rng.random_array().unwrap());
        let other_key = SecretBytes::from_bytes(rng.random_array().unwrap());

        let cipher = MessageCipher::new(&message_key).unwrap();
        let other_cipher = MessageCipher::new(&other_key).unwrap();

        let mut ciphertext = vec![0u8; ciphertext_length(32)];
        cipher.encrypt(&[7u8; 32], &mut ciphertext).unwrap();

        // Unpadding with the wrong key either fails outright or produces garbage; the tag is
        // what actually authenticates a message.
        if let Ok(plaintext) = other_cipher.decrypt(&ciphertext) {
            assert_ne!(&plaintext[..], &[7u8; 32]);
        }
    }
}
