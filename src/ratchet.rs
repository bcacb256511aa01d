// SPDX-License-Identifier: MIT OR Apache-2.0

//! Double ratchet: derives a fresh message key for every message from an initial shared secret
//! plus ongoing Diffie-Hellman exchanges.
//!
//! Each side holds a root key, at most one sending chain and a short history of receiving
//! chains. Receiving a message under a previously unseen ratchet key advances the root ratchet
//! and retires the sending chain, so the next outgoing message starts a fresh one under a newly
//! generated key. Message keys for messages that have not arrived yet are parked in a bounded
//! skipped-key store, which makes out-of-order delivery within the configured window
//! transparent to the caller.
//!
//! Decryption is verify-then-commit: candidate chain keys are advanced on copies and no state
//! changes unless the authentication tag checks out.
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::cipher::{self, CipherError, MessageCipher, MAC_LENGTH, MESSAGE_KEY_SIZE};
use crate::crypto::hkdf::{hkdf_sha256, KdfError};
use crate::crypto::x25519::{KeyPair, PublicKey, SecretKey, X25519Error, KEY_SIZE};
use crate::crypto::SecretBytes;
use crate::message::{self, MessageReader};
use crate::pickle::{Cursor, Pickle, PickleError, Unpickle};

type HmacSha256 = Hmac<Sha256>;

const ROOT_KDF_INFO: &[u8] = b"OLM_ROOT";
const CHAIN_KDF_INFO: &[u8] = b"OLM_RATCHET";

const MESSAGE_KEY_SEED: [u8; 1] = [0x01];
const CHAIN_KEY_SEED: [u8; 1] = [0x02];

const PROTOCOL_VERSION: u8 = 0x03;

const MAX_RECEIVER_CHAINS: usize = 5;
const MAX_SKIPPED_MESSAGE_KEYS: usize = 40;
const MAX_MESSAGE_GAP: u32 = 2000;

/// Length of the concatenated handshake secret the ratchet is initialised from.
pub const SHARED_SECRET_LENGTH: usize = 96;

const ROOT_KEY_SIZE: usize = 32;
const CHAIN_KEY_SIZE: usize = 32;

/// Random bytes needed to start a new sending chain.
const RATCHET_KEY_SEED_LENGTH: usize = 32;

#[derive(Clone, Debug)]
struct ChainKey {
    key: SecretBytes<CHAIN_KEY_SIZE>,
    index: u32,
}

impl ChainKey {
    fn create_message_key(&self) -> MessageKey {
        MessageKey {
            key: SecretBytes::from_bytes(hmac_sha256(self.key.as_bytes(), &MESSAGE_KEY_SEED)),
            index: self.index,
        }
    }

    fn advance(&mut self) {
        self.key = SecretBytes::from_bytes(hmac_sha256(self.key.as_bytes(), &CHAIN_KEY_SEED));
        self.index += 1;
    }
}

#[derive(Clone, Debug)]
struct MessageKey {
    key: SecretBytes<MESSAGE_KEY_SIZE>,
    index: u32,
}

#[derive(Clone, Debug)]
struct SenderChain {
    ratchet_key: KeyPair,
    chain_key: ChainKey,
}

#[derive(Clone, Debug)]
struct ReceiverChain {
    ratchet_key: PublicKey,
    chain_key: ChainKey,
}

#[derive(Clone, Debug)]
struct SkippedMessageKey {
    ratchet_key: PublicKey,
    message_key: MessageKey,
}

/// Stateful key schedule plus message cipher for one direction pair of a session.
#[derive(Clone, Debug)]
pub struct Ratchet {
    root_key: SecretBytes<ROOT_KEY_SIZE>,
    sender_chain: Option<SenderChain>,
    /// Newest first.
    receiver_chains: Vec<ReceiverChain>,
    skipped_message_keys: Vec<SkippedMessageKey>,
}

impl Ratchet {
    /// Initialises the side which starts out holding the ratchet key secret. The first sending
    /// chain is seeded directly from the shared secret.
    pub fn initialise_as_alice(
        shared_secret: &[u8; SHARED_SECRET_LENGTH],
        our_ratchet_key: KeyPair,
    ) -> Result<Self, RatchetError> {
        let (root_key, chain_key) = derive_initial_keys(shared_secret)?;
        Ok(Self {
            root_key,
            sender_chain: Some(SenderChain {
                ratchet_key: our_ratchet_key,
                chain_key,
            }),
            receiver_chains: Vec::new(),
            skipped_message_keys: Vec::new(),
        })
    }

    /// Initialises the side which only knows the peer's ratchet public key. The chain seeded
    /// from the shared secret belongs to the peer, so it becomes the first receiving chain; a
    /// sending chain is created on the first encrypt.
    pub fn initialise_as_bob(
        shared_secret: &[u8; SHARED_SECRET_LENGTH],
        their_ratchet_key: PublicKey,
    ) -> Result<Self, RatchetError> {
        let (root_key, chain_key) = derive_initial_keys(shared_secret)?;
        Ok(Self {
            root_key,
            sender_chain: None,
            receiver_chains: vec![ReceiverChain {
                ratchet_key: their_ratchet_key,
                chain_key,
            }],
            skipped_message_keys: Vec::new(),
        })
    }

    /// Number of random bytes [`Ratchet::encrypt`] consumes; non-zero exactly when the next
    /// message starts a fresh sending chain.
    pub fn encrypt_random_length(&self) -> usize {
        if self.sender_chain.is_some() {
            0
        } else {
            RATCHET_KEY_SEED_LENGTH
        }
    }

    /// Size of the encoded message produced for a plaintext of the given length.
    pub fn encrypt_output_length(&self, plaintext_length: usize) -> usize {
        let counter = self
            .sender_chain
            .as_ref()
            .map(|chain| chain.chain_key.index)
            .unwrap_or(0);
        message::encode_message_length(
            counter,
            KEY_SIZE,
            cipher::ciphertext_length(plaintext_length),
        ) + MAC_LENGTH
    }

    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random: &[u8],
        message: &mut [u8],
    ) -> Result<usize, RatchetError> {
        if random.len() < self.encrypt_random_length() {
            return Err(RatchetError::NotEnoughRandom);
        }
        if message.len() < self.encrypt_output_length(plaintext.len()) {
            return Err(RatchetError::OutputBufferTooSmall);
        }

        if self.sender_chain.is_none() {
            let their_ratchet_key = self
                .receiver_chains
                .first()
                .expect("a ratchet without a sending chain has a receiving chain")
                .ratchet_key;

            let mut seed: [u8; RATCHET_KEY_SEED_LENGTH] = random[..RATCHET_KEY_SEED_LENGTH]
                .try_into()
                .expect("random length checked above");
            let ratchet_key = KeyPair::from_seed(seed)?;
            seed.zeroize();

            let (root_key, chain_key) =
                derive_ratchet_keys(&self.root_key, ratchet_key.secret(), &their_ratchet_key)?;
            self.root_key = root_key;
            self.sender_chain = Some(SenderChain {
                ratchet_key,
                chain_key,
            });
        }

        let (counter, message_key, ratchet_key) = {
            let chain = self
                .sender_chain
                .as_mut()
                .expect("sending chain was created above");
            let counter = chain.chain_key.index;
            let message_key = chain.chain_key.create_message_key();
            chain.chain_key.advance();
            (counter, message_key, *chain.ratchet_key.public_key())
        };

        let ciphertext_length = cipher::ciphertext_length(plaintext.len());
        let length =
            message::encode_message_length(counter, KEY_SIZE, ciphertext_length) + MAC_LENGTH;
        let output = &mut message[..length];
        let body_length = length - MAC_LENGTH;

        let message_cipher = MessageCipher::new(&message_key.key)?;
        {
            let writer = message::encode_message(
                PROTOCOL_VERSION,
                counter,
                KEY_SIZE,
                ciphertext_length,
                &mut output[..body_length],
            );
            writer.ratchet_key.copy_from_slice(ratchet_key.as_bytes());
            message_cipher.encrypt(plaintext, writer.ciphertext)?;
        }
        let tag = message_cipher.mac(&output[..body_length]);
        output[body_length..].copy_from_slice(&tag);

        Ok(length)
    }

    /// Upper bound on the plaintext size contained in an encoded message.
    pub fn decrypt_max_plaintext_length(&self, message: &[u8]) -> Result<usize, RatchetError> {
        let reader = message::decode_message(message, MAC_LENGTH);
        let Some(ciphertext) = reader.ciphertext else {
            return Err(RatchetError::BadMessageFormat);
        };
        Ok(ciphertext.len())
    }

    pub fn decrypt(&mut self, message: &[u8], plaintext: &mut [u8]) -> Result<usize, RatchetError> {
        let reader = message::decode_message(message, MAC_LENGTH);
        if reader.version != PROTOCOL_VERSION {
            return Err(RatchetError::BadMessageVersion);
        }
        let (Some(ratchet_key), Some(counter), Some(ciphertext)) =
            (reader.ratchet_key, reader.counter, reader.ciphertext)
        else {
            return Err(RatchetError::BadMessageFormat);
        };
        if ratchet_key.len() != KEY_SIZE {
            return Err(RatchetError::BadMessageFormat);
        }
        let counter = u32::try_from(counter).map_err(|_| RatchetError::BadMessageFormat)?;
        if plaintext.len() < ciphertext.len() {
            return Err(RatchetError::OutputBufferTooSmall);
        }
        let their_ratchet_key = PublicKey::from_bytes(
            ratchet_key
                .try_into()
                .expect("ratchet key length checked above"),
        );

        let position = self
            .receiver_chains
            .iter()
            .position(|chain| chain.ratchet_key == their_ratchet_key);

        match position {
            None => self.decrypt_with_new_chain(&reader, their_ratchet_key, counter, plaintext),
            Some(index) if counter < self.receiver_chains[index].chain_key.index => {
                self.decrypt_with_skipped_key(&reader, &their_ratchet_key, counter, plaintext)
            }
            Some(index) => self.decrypt_with_existing_chain(&reader, index, counter, plaintext),
        }
    }

    /// The peer ratcheted: derive the next root and receiving chain, and only commit them (and
    /// drop our sending chain) after the message authenticated.
    fn decrypt_with_new_chain(
        &mut self,
        reader: &MessageReader<'_>,
        their_ratchet_key: PublicKey,
        counter: u32,
        plaintext: &mut [u8],
    ) -> Result<usize, RatchetError> {
        let sender = self
            .sender_chain
            .as_ref()
            .ok_or(RatchetError::BadMessageFormat)?;
        let (root_key, chain_key) =
            derive_ratchet_keys(&self.root_key, sender.ratchet_key.secret(), &their_ratchet_key)?;
        let (advanced, message_key, skipped) = advance_to(&chain_key, counter)?;
        let written = decrypt_with_message_key(&message_key, reader, plaintext)?;

        self.root_key = root_key;
        self.sender_chain = None;
        self.receiver_chains.insert(
            0,
            ReceiverChain {
                ratchet_key: their_ratchet_key,
                chain_key: advanced,
            },
        );
        self.receiver_chains.truncate(MAX_RECEIVER_CHAINS);
        self.store_skipped_keys(their_ratchet_key, skipped);

        Ok(written)
    }

    fn decrypt_with_existing_chain(
        &mut self,
        reader: &MessageReader<'_>,
        index: usize,
        counter: u32,
        plaintext: &mut [u8],
    ) -> Result<usize, RatchetError> {
        let (advanced, message_key, skipped) =
            advance_to(&self.receiver_chains[index].chain_key, counter)?;
        let written = decrypt_with_message_key(&message_key, reader, plaintext)?;

        let ratchet_key = self.receiver_chains[index].ratchet_key;
        self.receiver_chains[index].chain_key = advanced;
        self.store_skipped_keys(ratchet_key, skipped);

        Ok(written)
    }

    /// The counter lies behind the receiving chain: the message key must have been parked when
    /// its successors arrived first. A parked key is good for exactly one message.
    fn decrypt_with_skipped_key(
        &mut self,
        reader: &MessageReader<'_>,
        their_ratchet_key: &PublicKey,
        counter: u32,
        plaintext: &mut [u8],
    ) -> Result<usize, RatchetError> {
        let position = self
            .skipped_message_keys
            .iter()
            .position(|skipped| {
                skipped.ratchet_key == *their_ratchet_key && skipped.message_key.index == counter
            })
            .ok_or(RatchetError::BadMessageMac)?;

        let written =
            decrypt_with_message_key(&self.skipped_message_keys[position].message_key, reader, plaintext)?;
        self.skipped_message_keys.remove(position);

        Ok(written)
    }

    fn store_skipped_keys(&mut self, ratchet_key: PublicKey, skipped: Vec<MessageKey>) {
        for message_key in skipped {
            self.skipped_message_keys.push(SkippedMessageKey {
                ratchet_key,
                message_key,
            });
        }
        if self.skipped_message_keys.len() > MAX_SKIPPED_MESSAGE_KEYS {
            let excess = self.skipped_message_keys.len() - MAX_SKIPPED_MESSAGE_KEYS;
            self.skipped_message_keys.drain(..excess);
        }
    }
}

fn hmac_sha256(key: &[u8], input: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(input);
    mac.finalize().into_bytes().into()
}

fn derive_initial_keys(
    shared_secret: &[u8; SHARED_SECRET_LENGTH],
) -> Result<(SecretBytes<ROOT_KEY_SIZE>, ChainKey), RatchetError> {
    let derived = Zeroizing::new(hkdf_sha256::<{ ROOT_KEY_SIZE + CHAIN_KEY_SIZE }>(
        b"",
        shared_secret,
        ROOT_KDF_INFO,
    )?);
    Ok(split_derived(&derived))
}

fn derive_ratchet_keys(
    root_key: &SecretBytes<ROOT_KEY_SIZE>,
    our_key: &SecretKey,
    their_key: &PublicKey,
) -> Result<(SecretBytes<ROOT_KEY_SIZE>, ChainKey), RatchetError> {
    let shared_secret = Zeroizing::new(our_key.shared_secret(their_key)?);
    let derived = Zeroizing::new(hkdf_sha256::<{ ROOT_KEY_SIZE + CHAIN_KEY_SIZE }>(
        root_key.as_bytes(),
        &*shared_secret,
        CHAIN_KDF_INFO,
    )?);
    Ok(split_derived(&derived))
}

fn split_derived(derived: &[u8; ROOT_KEY_SIZE + CHAIN_KEY_SIZE]) -> (SecretBytes<ROOT_KEY_SIZE>, ChainKey) {
    let root_key = SecretBytes::from_bytes(
        derived[..ROOT_KEY_SIZE]
            .try_into()
            .expect("root key slice has fixed length"),
    );
    let chain_key = ChainKey {
        key: SecretBytes::from_bytes(
            derived[ROOT_KEY_SIZE..]
                .try_into()
                .expect("chain key slice has fixed length"),
        ),
        index: 0,
    };
    (root_key, chain_key)
}

/// Advances a copy of the chain key up to `counter`, returning the chain state after consuming
/// that message, the message key for it and the keys for all indices stepped over.
fn advance_to(
    chain_key: &ChainKey,
    counter: u32,
) -> Result<(ChainKey, MessageKey, Vec<MessageKey>), RatchetError> {
    if counter - chain_key.index > MAX_MESSAGE_GAP {
        return Err(RatchetError::MessageGapTooLarge);
    }

    let mut chain = chain_key.clone();
    let mut skipped = Vec::new();
    while chain.index < counter {
        skipped.push(chain.create_message_key());
        chain.advance();
    }
    let message_key = chain.create_message_key();
    chain.advance();

    Ok((chain, message_key, skipped))
}

fn decrypt_with_message_key(
    message_key: &MessageKey,
    reader: &MessageReader<'_>,
    plaintext_out: &mut [u8],
) -> Result<usize, RatchetError> {
    let ciphertext = reader
        .ciphertext
        .expect("caller decoded the ciphertext field");
    let message_cipher = MessageCipher::new(&message_key.key)?;
    message_cipher.verify_mac(reader.body, reader.mac)?;
    let plaintext = message_cipher.decrypt(ciphertext)?;
    plaintext_out[..plaintext.len()].copy_from_slice(&plaintext);
    Ok(plaintext.len())
}

#[derive(Debug, Error)]
pub enum RatchetError {
    #[error("not enough random bytes provided for encryption")]
    NotEnoughRandom,

    #[error("output buffer too small")]
    OutputBufferTooSmall,

    #[error("unknown message version")]
    BadMessageVersion,

    #[error("message is malformed")]
    BadMessageFormat,

    #[error("message authentication failed")]
    BadMessageMac,

    #[error("gap between message counters is too large")]
    MessageGapTooLarge,

    #[error(transparent)]
    KeyAgreement(#[from] X25519Error),

    #[error(transparent)]
    Kdf(#[from] KdfError),
}

impl From<CipherError> for RatchetError {
    fn from(error: CipherError) -> Self {
        match error {
            CipherError::BadMac | CipherError::BadPadding => RatchetError::BadMessageMac,
            CipherError::OutputBufferTooSmall => RatchetError::OutputBufferTooSmall,
            CipherError::Kdf(error) => RatchetError::Kdf(error),
        }
    }
}

// Persistence. Chains are stored newest first, in the order they are held in memory.

impl Pickle for ChainKey {
    fn pickle_length(&self) -> usize {
        self.key.pickle_length() + self.index.pickle_length()
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        self.key.pickle(buffer);
        self.index.pickle(buffer);
    }
}

impl Unpickle for ChainKey {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        Ok(Self {
            key: SecretBytes::unpickle(cursor)?,
            index: u32::unpickle(cursor)?,
        })
    }
}

impl Pickle for Ratchet {
    fn pickle_length(&self) -> usize {
        let mut length = self.root_key.pickle_length();
        length += 4;
        if let Some(sender) = &self.sender_chain {
            length += sender.ratchet_key.pickle_length() + sender.chain_key.pickle_length();
        }
        length += 4;
        for chain in &self.receiver_chains {
            length += chain.ratchet_key.pickle_length() + chain.chain_key.pickle_length();
        }
        length += 4;
        for skipped in &self.skipped_message_keys {
            length += skipped.ratchet_key.pickle_length()
                + skipped.message_key.key.pickle_length()
                + skipped.message_key.index.pickle_length();
        }
        length
    }

    fn pickle(&self, buffer: &mut Vec<u8>) {
        self.root_key.pickle(buffer);

        (self.sender_chain.iter().count() as u32).pickle(buffer);
        if let Some(sender) = &self.sender_chain {
            sender.ratchet_key.pickle(buffer);
            sender.chain_key.pickle(buffer);
        }

        (self.receiver_chains.len() as u32).pickle(buffer);
        for chain in &self.receiver_chains {
            chain.ratchet_key.pickle(buffer);
            chain.chain_key.pickle(buffer);
        }

        (self.skipped_message_keys.len() as u32).pickle(buffer);
        for skipped in &self.skipped_message_keys {
            skipped.ratchet_key.pickle(buffer);
            skipped.message_key.key.pickle(buffer);
            skipped.message_key.index.pickle(buffer);
        }
    }
}

impl Unpickle for Ratchet {
    fn unpickle(cursor: &mut Cursor<'_>) -> Result<Self, PickleError> {
        let root_key = SecretBytes::unpickle(cursor)?;

        let sender_count = u32::unpickle(cursor)?;
        let sender_chain = match sender_count {
            0 => None,
            1 => Some(SenderChain {
                ratchet_key: KeyPair::unpickle(cursor)?,
                chain_key: ChainKey::unpickle(cursor)?,
            }),
            _ => return Err(PickleError::Invalid),
        };

        let receiver_count = u32::unpickle(cursor)?;
        if receiver_count as usize > MAX_RECEIVER_CHAINS {
            return Err(PickleError::Invalid);
        }
        let mut receiver_chains = Vec::with_capacity(receiver_count as usize);
        for _ in 0..receiver_count {
            receiver_chains.push(ReceiverChain {
                ratchet_key: PublicKey::unpickle(cursor)?,
                chain_key: ChainKey::unpickle(cursor)?,
            });
        }

        let skipped_count = u32::unpickle(cursor)?;
        if skipped_count as usize > MAX_SKIPPED_MESSAGE_KEYS {
            return Err(PickleError::Invalid);
        }
        let mut skipped_message_keys = Vec::with_capacity(skipped_count as usize);
        for _ in 0..skipped_count {
            skipped_message_keys.push(SkippedMessageKey {
                ratchet_key: PublicKey::unpickle(cursor)?,
                message_key: MessageKey {
                    key: SecretBytes::unpickle(cursor)?,
                    index: u32::unpickle(cursor)?,
                },
            });
        }

        Ok(Self {
            root_key,
            sender_chain,
            receiver_chains,
            skipped_message_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::x25519::KeyPair;
    use crate::crypto::Rng;
    use crate::pickle::{Cursor, Pickle, Unpickle};

    use super::{Ratchet, RatchetError, SHARED_SECRET_LENGTH};

    fn ratchet_pair(rng: &Rng) -> (Ratchet, Ratchet) {
        let shared_secret: [u8; SHARED_SECRET_LENGTH] = rng.random_array().unwrap();
        let ratchet_key = KeyPair::from_seed(rng.random_array().unwrap()).unwrap();

        let bob = Ratchet::initialise_as_bob(&shared_secret, *ratchet_key.public_key()).unwrap();
        let alice = Ratchet::initialise_as_alice(&shared_secret, ratchet_key).unwrap();
        (alice, bob)
    }

    fn encrypt(ratchet: &mut Ratchet, rng: &Rng, plaintext: &[u8]) -> Vec<u8> {
        let random = rng.random_vec(ratchet.encrypt_random_length()).unwrap();
        let mut message = vec![0u8; ratchet.encrypt_output_length(plaintext.len())];
        let written = ratchet.encrypt(plaintext, &random, &mut message).unwrap();
        message.truncate(written);
        message
    }

    fn decrypt(ratchet: &mut Ratchet, message: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let mut plaintext = vec![0u8; ratchet.decrypt_max_plaintext_length(message)?];
        let written = ratchet.decrypt(message, &mut plaintext)?;
        plaintext.truncate(written);
        Ok(plaintext)
    }

    #[test]
    fn conversation_with_ratchet_steps() {
        let rng = Rng::from_seed([1; 32]);
        let (mut alice, mut bob) = ratchet_pair(&rng);

        // Alice holds the initial sending chain and needs no randomness.
        assert_eq!(alice.encrypt_random_length(), 0);
        // Bob starts a fresh chain on his first reply.
        assert_eq!(bob.encrypt_random_length(), 32);

        let message_1 = encrypt(&mut alice, &rng, b"Hello, Bob!");
        assert_eq!(decrypt(&mut bob, &message_1).unwrap(), b"Hello, Bob!");

        let message_2 = encrypt(&mut bob, &rng, b"Hello, Alice!");
        assert_eq!(decrypt(&mut alice, &message_2).unwrap(), b"Hello, Alice!");

        // Alice's sending chain was retired when Bob's new ratchet key arrived.
        assert_eq!(alice.encrypt_random_length(), 32);

        let message_3 = encrypt(&mut alice, &rng, b"How are you?");
        assert_eq!(decrypt(&mut bob, &message_3).unwrap(), b"How are you?");

        let message_4 = encrypt(&mut bob, &rng, b"Still here.");
        assert_eq!(decrypt(&mut alice, &message_4).unwrap(), b"Still here.");
    }

    #[test]
    fn out_of_order_messages_use_skipped_keys() {
        let rng = Rng::from_seed([2; 32]);
        let (mut alice, mut bob) = ratchet_pair(&rng);

        let message_1 = encrypt(&mut alice, &rng, b"one");
        let message_2 = encrypt(&mut alice, &rng, b"two");
        let message_3 = encrypt(&mut alice, &rng, b"three");

        assert_eq!(decrypt(&mut bob, &message_3).unwrap(), b"three");
        assert_eq!(decrypt(&mut bob, &message_1).unwrap(), b"one");
        assert_eq!(decrypt(&mut bob, &message_2).unwrap(), b"two");

        // A parked key is single-use: replaying fails the authentication check.
        assert!(matches!(
            decrypt(&mut bob, &message_2),
            Err(RatchetError::BadMessageMac)
        ));
    }

    #[test]
    fn tampered_message_does_not_advance_state() {
        let rng = Rng::from_seed([3; 32]);
        let (mut alice, mut bob) = ratchet_pair(&rng);

        let mut message = encrypt(&mut alice, &rng, b"payload");
        let last = message.len() - 1;
        message[last] ^= 1;

        assert!(matches!(
            decrypt(&mut bob, &message),
            Err(RatchetError::BadMessageMac)
        ));

        // The untampered message still decrypts afterwards.
        message[last] ^= 1;
        assert_eq!(decrypt(&mut bob, &message).unwrap(), b"payload");
    }

    #[test]
    fn wrong_version_is_rejected() {
        let rng = Rng::from_seed([4; 32]);
        let (mut alice, mut bob) = ratchet_pair(&rng);

        let mut message = encrypt(&mut alice, &rng, b"payload");
        message[0] = 0x02;

        assert!(matches!(
            decrypt(&mut bob, &message),
            Err(RatchetError::BadMessageVersion)
        ));
    }

    #[test]
    fn short_output_buffer_is_rejected() {
        let rng = Rng::from_seed([5; 32]);
        let (mut alice, _bob) = ratchet_pair(&rng);

        let mut message = vec![0u8; alice.encrypt_output_length(5) - 1];
        assert!(matches!(
            alice.encrypt(b"hello", &[], &mut message),
            Err(RatchetError::OutputBufferTooSmall)
        ));
    }

    #[test]
    fn pickle_round_trip() {
        let rng = Rng::from_seed([6; 32]);
        let (mut alice, mut bob) = ratchet_pair(&rng);

        // Build up state: a ratchet step and a skipped key on Bob's side.
        let message_1 = encrypt(&mut alice, &rng, b"one");
        let _skipped = encrypt(&mut alice, &rng, b"never delivered");
        let message_3 = encrypt(&mut alice, &rng, b"three");
        decrypt(&mut bob, &message_1).unwrap();
        decrypt(&mut bob, &message_3).unwrap();
        let reply = encrypt(&mut bob, &rng, b"reply");
        decrypt(&mut alice, &reply).unwrap();

        for ratchet in [&alice, &bob] {
            let mut buffer = Vec::new();
            ratchet.pickle(&mut buffer);
            assert_eq!(buffer.len(), ratchet.pickle_length());

            let restored = Ratchet::unpickle(&mut Cursor::new(&buffer)).unwrap();
            let mut buffer_again = Vec::new();
            restored.pickle(&mut buffer_again);
            assert_eq!(buffer, buffer_again);
        }

        // The restored ratchet keeps working against the live peer.
        let mut buffer = Vec::new();
        bob.pickle(&mut buffer);
        let mut restored_bob = Ratchet::unpickle(&mut Cursor::new(&buffer)).unwrap();

        let message = encrypt(&mut alice, &rng, b"after restore");
        assert_eq!(decrypt(&mut restored_bob, &message).unwrap(), b"after restore");
    }
}
