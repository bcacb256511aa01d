// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session establishment and message framing between an initiator ("Alice") and a responder
//! ("Bob").
//!
//! An outbound session performs the triple Diffie-Hellman handshake against the responder's
//! published identity and one-time keys and starts out sending *prekey messages*: envelopes
//! carrying the initiator's identity and base keys plus the one-time key id, wrapped around a
//! regular ratchet message. The responder bootstraps a matching inbound session from the first
//! such envelope. Once a session has decrypted any message from its peer it latches and frames
//! all further traffic as bare ratchet messages.
//!
//! Which of the two framings a message uses is not visible on the wire; the transport carries
//! the [`MessageType`] out-of-band and hands it back in for decryption.
use thiserror::Error;
use zeroize::Zeroizing;

use crate::account::{Account, IdentityKey, KeyId, RemoteKey};
use crate::crypto::cipher::MAC_LENGTH;
use crate::crypto::x25519::{KeyPair, PublicKey, X25519Error, KEY_SIZE};
use crate::message;
use crate::pickle::{Cursor, Pickle, PickleError, Unpickle};
use crate::ratchet::{Ratchet, RatchetError, SHARED_SECRET_LENGTH};

const PROTOCOL_VERSION: u8 = 0x03;

/// Framing of an encrypted message, carried out-of-band by the transport.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Prekey envelope wrapping a ratchet message; sent until the session latches.
    PreKey,
    /// Bare ratchet message.
    Message,
}

/// Coarse error code mirroring [`SessionError`], kept as a pollable echo of the last failed
/// operation for hosts that track errors out-of-band.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ErrorCode {
    #[default]
    Success,
    NotEnoughRandom,
    OutputBufferTooSmall,
    BadMessageVersion,
    BadMessageFormat,
    BadMessageMac,
    BadMessageKeyId,
    Unknown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not enough random bytes provided")]
    NotEnoughRandom,

    #[error("output buffer too small")]
    OutputBufferTooSmall,

    #[error("message is malformed")]
    BadMessageFormat,

    #[error("unknown one-time key id")]
    BadMessageKeyId,

    #[error(transparent)]
    Ratchet(RatchetError),

    #[error(transparent)]
    KeyAgreement(#[from] X25519Error),
}

impl SessionError {
    fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotEnoughRandom => ErrorCode::NotEnoughRandom,
            SessionError::OutputBufferTooSmall => ErrorCode::OutputBufferTooSmall,
            SessionError::BadMessageFormat => ErrorCode::BadMessageFormat,
            SessionError::BadMessageKeyId => ErrorCode::BadMessageKeyId,
            SessionError::Ratchet(error) => match error {
                RatchetError::NotEnoughRandom => ErrorCode::NotEnoughRandom,
                RatchetError::OutputBufferTooSmall => ErrorCode::OutputBufferTooSmall,
                RatchetError::BadMessageVersion => ErrorCode::BadMessageVersion,
                RatchetError::BadMessageFormat | RatchetError::MessageGapTooLarge => {
                    ErrorCode::BadMessageFormat
                }
                RatchetError::BadMessageMac => ErrorCode::BadMessageMac,
                RatchetError::KeyAgreement(_) | RatchetError::Kdf(_) => ErrorCode::Unknown,
            },
            SessionError::KeyAgreement(_) => ErrorCode::Unknown,
        }
    }
}

/// Single-owner session between two parties.
///
/// Born through [`Session::new_outbound`] on the initiator or [`Session::new_inbound`] on the
/// responder, mutated only by encrypting and decrypting, and restorable byte-exactly via
/// [`Session::pickle`] / [`Session::unpickle`].
#[derive(Clone, Debug)]
pub struct Session {
    received_message: bool,
    alice_identity_key: IdentityKey,
    alice_base_key: PublicKey,
    bob_one_time_key_id: KeyId,
    ratchet: Ratchet,
    last_error: ErrorCode,
}

impl Session {
    /// Random bytes [`Session::new_outbound`] consumes: one seed for the base key, one for the
    /// initial ratchet key.
    pub fn new_outbound_random_length() -> usize {
        KEY_SIZE * 2
    }

    /// Creates the initiator side of a session against the responder's identity key and one of
    /// its published one-time keys.
    pub fn new_outbound(
        account: &Account,
        their_identity_key: &PublicKey,
        their_one_time_key: &RemoteKey,
        random: &[u8],
    ) -> Result<Self, SessionError> {
        if random.len() < Self::new_outbound_random_length() {
            return Err(SessionError::NotEnoughRandom);
        }

        let base_key = KeyPair::from_seed(
            random[..KEY_SIZE]
                .try_into()
                .expect("random length checked above"),
        )?;
        let ratchet_key = KeyPair::from_seed(
            random[KEY_SIZE..2 * KEY_SIZE]
                .try_into()
                .expect("random length checked above"),
        )?;

        let identity = account.identity_key();

        // Triple Diffie-Hellman. The concatenation order is normative; both sides must derive
        // the same 96 bytes.
        let mut shared_secret = Zeroizing::new([0u8; SHARED_SECRET_LENGTH]);
        let agreement = Zeroizing::new(
            identity
                .key()
                .secret()
                .shared_secret(their_one_time_key.key())?,
        );
        shared_secret[..32].copy_from_slice(&*agreement);
        let agreement =
            Zeroizing::new(base_key.secret().shared_secret(their_identity_key)?);
        shared_secret[32..64].copy_from_slice(&*agreement);
        let agreement = Zeroizing::new(
            base_key
                .secret()
                .shared_secret(their_one_time_key.key())?,
        );
        shared_secret[64..].copy_from_slice(&*agreement);

        let ratchet = Ratchet::initialise_as_alice(&shared_secret, ratchet_key)
            .map_err(SessionError::Ratchet)?;

        Ok(Self {
            received_message: false,
            alice_identity_key: IdentityKey::new(identity.id(), *identity.key().public_key()),
            alice_base_key: *base_key.public_key(),
            bob_one_time_key_id: their_one_time_key.id(),
            ratchet,
            last_error: ErrorCode::Success,
        })
    }

    /// Creates the responder side of a session from a received prekey message.
    ///
    /// This does not decrypt the wrapped message; decrypt it through [`Session::decrypt`] once
    /// the session exists. The consumed one-time key stays in the account; hosts should remove
    /// it afterwards to rule out reuse.
    pub fn new_inbound(account: &Account, message: &[u8]) -> Result<Self, SessionError> {
        let reader = message::decode_one_time_key_message(message);
        if !message::check_prekey_message_fields(&reader) {
            return Err(SessionError::BadMessageFormat);
        }

        let inner = message::decode_message(
            reader.message.expect("field check guarantees the message"),
            MAC_LENGTH,
        );
        let ratchet_key = match inner.ratchet_key {
            Some(key) if key.len() == KEY_SIZE => {
                PublicKey::from_bytes(key.try_into().expect("length checked above"))
            }
            _ => return Err(SessionError::BadMessageFormat),
        };

        let alice_identity_key = PublicKey::from_bytes(
            reader
                .identity_key
                .expect("field check guarantees the identity key")
                .try_into()
                .expect("field check guarantees the key length"),
        );
        let alice_base_key = PublicKey::from_bytes(
            reader
                .base_key
                .expect("field check guarantees the base key")
                .try_into()
                .expect("field check guarantees the key length"),
        );
        let one_time_key_id = reader
            .one_time_key_id
            .expect("field check guarantees the id");

        let one_time_key = account
            .lookup_key(one_time_key_id)
            .ok_or(SessionError::BadMessageKeyId)?;
        let identity = account.identity_key();

        // Mirror of the initiator's derivation with the private and public roles swapped.
        let mut shared_secret = Zeroizing::new([0u8; SHARED_SECRET_LENGTH]);
        let agreement = Zeroizing::new(
            one_time_key
                .key()
                .secret()
                .shared_secret(&alice_identity_key)?,
        );
        shared_secret[..32].copy_from_slice(&*agreement);
        let agreement = Zeroizing::new(
            identity
                .key()
                .secret()
                .shared_secret(&alice_base_key)?,
        );
        shared_secret[32..64].copy_from_slice(&*agreement);
        let agreement = Zeroizing::new(
            one_time_key
                .key()
                .secret()
                .shared_secret(&alice_base_key)?,
        );
        shared_secret[64..].copy_from_slice(&*agreement);

        let ratchet = Ratchet::initialise_as_bob(&shared_secret, ratchet_key)
            .map_err(SessionError::Ratchet)?;

        Ok(Self {
            received_message: false,
            // The initiator's id numbering is local to the initiator; unknown on this side.
            alice_identity_key: IdentityKey::new(0, alice_identity_key),
            alice_base_key,
            bob_one_time_key_id: one_time_key_id,
            ratchet,
            last_error: ErrorCode::Success,
        })
    }

    /// Whether a received prekey message belongs to this session: its identity key, base key
    /// and one-time key id all match the handshake this session was created from. No side
    /// effects; malformed input is simply no match.
    pub fn matches_inbound_session(&self, message: &[u8]) -> bool {
        let reader = message::decode_one_time_key_message(message);
        if !message::check_prekey_message_fields(&reader) {
            return false;
        }

        reader.identity_key == Some(self.alice_identity_key.key().as_bytes().as_slice())
            && reader.base_key == Some(self.alice_base_key.as_bytes().as_slice())
            && reader.one_time_key_id == Some(self.bob_one_time_key_id)
    }

    /// Framing the next outgoing message will use.
    pub fn encrypt_message_type(&self) -> MessageType {
        if self.received_message {
            MessageType::Message
        } else {
            MessageType::PreKey
        }
    }

    /// Size of the encoded message produced for a plaintext of the given length, including the
    /// prekey envelope while the session has not latched.
    pub fn encrypt_message_length(&self, plaintext_length: usize) -> usize {
        let message_length = self.ratchet.encrypt_output_length(plaintext_length);

        if self.received_message {
            return message_length;
        }

        message::encode_one_time_key_message_length(
            self.bob_one_time_key_id,
            KEY_SIZE,
            KEY_SIZE,
            message_length,
        )
    }

    /// Random bytes [`Session::encrypt`] consumes for the next message.
    pub fn encrypt_random_length(&self) -> usize {
        self.ratchet.encrypt_random_length()
    }

    /// Encrypts `plaintext` into `message` and returns the number of bytes written.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random: &[u8],
        message: &mut [u8],
    ) -> Result<usize, SessionError> {
        let result = self.encrypt_inner(plaintext, random, message);
        self.note_error(result)
    }

    fn encrypt_inner(
        &mut self,
        plaintext: &[u8],
        random: &[u8],
        message: &mut [u8],
    ) -> Result<usize, SessionError> {
        if message.len() < self.encrypt_message_length(plaintext.len()) {
            return Err(SessionError::OutputBufferTooSmall);
        }

        if self.received_message {
            return self
                .ratchet
                .encrypt(plaintext, random, message)
                .map_err(SessionError::Ratchet);
        }

        let body_length = self.ratchet.encrypt_output_length(plaintext.len());
        let length = message::encode_one_time_key_message_length(
            self.bob_one_time_key_id,
            KEY_SIZE,
            KEY_SIZE,
            body_length,
        );
        let writer = message::encode_one_time_key_message(
            PROTOCOL_VERSION,
            self.bob_one_time_key_id,
            KEY_SIZE,
            KEY_SIZE,
            body_length,
            &mut message[..length],
        );
        writer
            .identity_key
            .copy_from_slice(self.alice_identity_key.key().as_bytes());
        writer.base_key.copy_from_slice(self.alice_base_key.as_bytes());
        self.ratchet
            .encrypt(plaintext, random, writer.message)
            .map_err(SessionError::Ratchet)?;

        Ok(length)
    }

    /// Upper bound on the plaintext size contained in an encoded message.
    pub fn decrypt_max_plaintext_length(
        &mut self,
        message_type: MessageType,
        message: &[u8],
    ) -> Result<usize, SessionError> {
        let result = Self::message_body(message_type, message).and_then(|body| {
            self.ratchet
                .decrypt_max_plaintext_length(body)
                .map_err(SessionError::Ratchet)
        });
        self.note_error(result)
    }

    /// Decrypts `message` into `plaintext` and returns the number of bytes written. The first
    /// success latches the session onto bare message framing for its own outgoing traffic.
    pub fn decrypt(
        &mut self,
        message_type: MessageType,
        message: &[u8],
        plaintext: &mut [u8],
    ) -> Result<usize, SessionError> {
        let result = self.decrypt_inner(message_type, message, plaintext);
        self.note_error(result)
    }

    fn decrypt_inner(
        &mut self,
        message_type: MessageType,
        message: &[u8],
        plaintext: &mut [u8],
    ) -> Result<usize, SessionError> {
        // The envelope's handshake fields are not re-checked here; they were validated when the
        // inbound session was created and carry no protocol meaning afterwards.
        let body = Self::message_body(message_type, message)?;
        let written = self
            .ratchet
            .decrypt(body, plaintext)
            .map_err(SessionError::Ratchet)?;
        self.received_message = true;
        Ok(written)
    }

    fn message_body(message_type: MessageType, message: &[u8]) -> Result<&[u8], SessionError> {
        match message_type {
            MessageType::Message => Ok(message),
            MessageType::PreKey => {
                let reader = message::decode_one_time_key_message(message);
                reader.message.ok_or(SessionError::BadMessageFormat)
            }
        }
    }

    /// Error code of the most recent failed operation. Left untouched by successful calls;
    /// reset it with [`Session::clear_last_error`] to use it as a latch.
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = ErrorCode::Success;
    }

    fn note_error<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(error) = &result {
            self.last_error = error.code();
        }
        result
    }

    /// Exact size of [`Session::pickle`]'s output for the current state.
    pub fn pickle_length(&self) -> usize {
        self.received_message.pickle_length()
            + self.alice_identity_key.id().pickle_length()
            + self.alice_identity_key.key().pickle_length()
            + self.alice_base_key.pickle_length()
            + self.bob_one_time_key_id.pickle_length()
            + self.ratchet.pickle_length()
    }

    /// Serializes the complete session state.
    pub fn pickle(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.pickle_length());
        self.received_message.pickle(&mut buffer);
        self.alice_identity_key.id().pickle(&mut buffer);
        self.alice_identity_key.key().pickle(&mut buffer);
        self.alice_base_key.pickle(&mut buffer);
        self.bob_one_time_key_id.pickle(&mut buffer);
        self.ratchet.pickle(&mut buffer);
        buffer
    }

    /// Restores a session from [`Session::pickle`] output.
    pub fn unpickle(bytes: &[u8]) -> Result<Self, PickleError> {
        let mut cursor = Cursor::new(bytes);
        let received_message = bool::unpickle(&mut cursor)?;
        let alice_identity_key_id = u32::unpickle(&mut cursor)?;
        let alice_identity_key = PublicKey::unpickle(&mut cursor)?;
        let alice_base_key = PublicKey::unpickle(&mut cursor)?;
        let bob_one_time_key_id = u32::unpickle(&mut cursor)?;
        let ratchet = Ratchet::unpickle(&mut cursor)?;

        Ok(Self {
            received_message,
            alice_identity_key: IdentityKey::new(alice_identity_key_id, alice_identity_key),
            alice_base_key,
            bob_one_time_key_id,
            ratchet,
            last_error: ErrorCode::Success,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::account::Account;
    use crate::crypto::Rng;

    use super::{ErrorCode, MessageType, Session, SessionError};

    /// Accounts for both parties, with one published one-time key on Bob's side.
    fn accounts(rng: &Rng) -> (Account, Account) {
        let alice = Account::new(rng).unwrap();
        let mut bob = Account::new(rng).unwrap();
        bob.generate_one_time_keys(1, rng).unwrap();
        (alice, bob)
    }

    fn outbound_session(rng: &Rng, alice: &Account, bob: &Account) -> Session {
        let one_time_key = bob.one_time_keys()[0];
        let random: [u8; 64] = rng.random_array().unwrap();
        Session::new_outbound(
            alice,
            bob.identity_key().key().public_key(),
            &one_time_key,
            &random,
        )
        .unwrap()
    }

    fn encrypt(session: &mut Session, rng: &Rng, plaintext: &[u8]) -> (MessageType, Vec<u8>) {
        let message_type = session.encrypt_message_type();
        let random = rng.random_vec(session.encrypt_random_length()).unwrap();
        let mut message = vec![0u8; session.encrypt_message_length(plaintext.len())];
        let written = session.encrypt(plaintext, &random, &mut message).unwrap();
        message.truncate(written);
        (message_type, message)
    }

    fn decrypt(
        session: &mut Session,
        message_type: MessageType,
        message: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let mut plaintext = vec![0u8; session.decrypt_max_plaintext_length(message_type, message)?];
        let written = session.decrypt(message_type, message, &mut plaintext)?;
        plaintext.truncate(written);
        Ok(plaintext)
    }

    #[test]
    fn establishment_round_trip() {
        let rng = Rng::from_seed([1; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);

        let (message_type, message) = encrypt(&mut alice, &rng, b"hello");
        assert_eq!(message_type, MessageType::PreKey);

        let mut bob = Session::new_inbound(&bob_account, &message).unwrap();
        assert_eq!(decrypt(&mut bob, message_type, &message).unwrap(), b"hello");

        // Alice has not received anything yet, so she keeps wrapping; Bob has decrypted but not
        // sent, so his first outgoing message is still prekey-framed.
        assert_eq!(alice.encrypt_message_type(), MessageType::PreKey);
        assert_eq!(bob.encrypt_message_type(), MessageType::Message);
    }

    #[test]
    fn message_type_latches_after_first_decrypt() {
        let rng = Rng::from_seed([2; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (message_type, message) = encrypt(&mut alice, &rng, b"hello");
        let mut bob = Session::new_inbound(&bob_account, &message).unwrap();
        decrypt(&mut bob, message_type, &message).unwrap();

        // A second outgoing message before any reply is still prekey-wrapped.
        let (message_type, _) = encrypt(&mut alice, &rng, b"hello again");
        assert_eq!(message_type, MessageType::PreKey);

        let (reply_type, reply) = encrypt(&mut bob, &rng, b"hi");
        assert_eq!(decrypt(&mut alice, reply_type, &reply).unwrap(), b"hi");

        // Alice latched; all further messages from her side are bare.
        assert_eq!(alice.encrypt_message_type(), MessageType::Message);
        let (message_type, message) = encrypt(&mut alice, &rng, b"how are you?");
        assert_eq!(message_type, MessageType::Message);
        assert_eq!(
            decrypt(&mut bob, message_type, &message).unwrap(),
            b"how are you?"
        );
    }

    #[test]
    fn prekey_messages_carry_identical_handshake_fields() {
        let rng = Rng::from_seed([3; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (_, message_1) = encrypt(&mut alice, &rng, b"one");
        let (_, message_2) = encrypt(&mut alice, &rng, b"a very different, longer payload");

        let reader_1 = crate::message::decode_one_time_key_message(&message_1);
        let reader_2 = crate::message::decode_one_time_key_message(&message_2);
        assert_eq!(reader_1.identity_key, reader_2.identity_key);
        assert_eq!(reader_1.base_key, reader_2.base_key);
        assert_eq!(reader_1.one_time_key_id, reader_2.one_time_key_id);
    }

    #[test]
    fn matching_inbound_session() {
        let rng = Rng::from_seed([4; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (_, message) = encrypt(&mut alice, &rng, b"hello");

        let bob = Session::new_inbound(&bob_account, &message).unwrap();
        assert!(bob.matches_inbound_session(&message));

        // A session built from a different base key does not match.
        let other = outbound_session(&rng, &alice_account, &bob_account);
        assert!(!other.matches_inbound_session(&message));

        // Malformed input never matches.
        assert!(!bob.matches_inbound_session(b"not a prekey message"));
    }

    #[test]
    fn pickle_round_trip_resumes_conversation() {
        let rng = Rng::from_seed([5; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (message_type, message) = encrypt(&mut alice, &rng, b"hello");
        let mut bob = Session::new_inbound(&bob_account, &message).unwrap();
        decrypt(&mut bob, message_type, &message).unwrap();
        let (reply_type, reply) = encrypt(&mut bob, &rng, b"hi");
        decrypt(&mut alice, reply_type, &reply).unwrap();

        let pickled = alice.pickle();
        assert_eq!(pickled.len(), alice.pickle_length());

        let mut restored = Session::unpickle(&pickled).unwrap();
        assert_eq!(restored.pickle(), pickled);
        assert_eq!(restored.encrypt_message_type(), MessageType::Message);

        // The restored session continues the conversation in both directions.
        let (message_type, message) = encrypt(&mut restored, &rng, b"back from disk");
        assert_eq!(
            decrypt(&mut bob, message_type, &message).unwrap(),
            b"back from disk"
        );
        let (reply_type, reply) = encrypt(&mut bob, &rng, b"welcome back");
        assert_eq!(
            decrypt(&mut restored, reply_type, &reply).unwrap(),
            b"welcome back"
        );
    }

    #[test]
    fn unpickle_rejects_truncated_input() {
        let rng = Rng::from_seed([6; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let alice = outbound_session(&rng, &alice_account, &bob_account);
        let pickled = alice.pickle();

        assert!(Session::unpickle(&pickled[..pickled.len() - 1]).is_err());
        assert!(Session::unpickle(&[]).is_err());
    }

    #[test]
    fn outbound_requires_enough_randomness() {
        let rng = Rng::from_seed([7; 32]);
        let (alice_account, bob_account) = accounts(&rng);
        let one_time_key = bob_account.one_time_keys()[0];

        let result = Session::new_outbound(
            &alice_account,
            bob_account.identity_key().key().public_key(),
            &one_time_key,
            &[0u8; 63],
        );
        assert!(matches!(result, Err(SessionError::NotEnoughRandom)));
    }

    #[test]
    fn encrypt_rejects_short_output_buffer() {
        let rng = Rng::from_seed([8; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let mut short = vec![0u8; alice.encrypt_message_length(5) - 1];
        let result = alice.encrypt(b"hello", &[], &mut short);
        assert!(matches!(result, Err(SessionError::OutputBufferTooSmall)));
        assert_eq!(alice.last_error(), ErrorCode::OutputBufferTooSmall);

        // The failed call left the ratchet untouched; a proper encrypt still round-trips.
        let (message_type, message) = encrypt(&mut alice, &rng, b"hello");
        let mut bob = Session::new_inbound(&bob_account, &message).unwrap();
        assert_eq!(decrypt(&mut bob, message_type, &message).unwrap(), b"hello");
    }

    #[test]
    fn inbound_with_unknown_key_id_fails() {
        let rng = Rng::from_seed([9; 32]);
        let (alice_account, mut bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (_, message) = encrypt(&mut alice, &rng, b"hello");

        // The host consumed the one-time key before the message arrived.
        let one_time_key_id = bob_account.one_time_keys()[0].id();
        bob_account.remove_one_time_key(one_time_key_id);

        let result = Session::new_inbound(&bob_account, &message);
        assert!(matches!(result, Err(SessionError::BadMessageKeyId)));
    }

    #[test]
    fn inbound_with_malformed_envelope_fails() {
        let rng = Rng::from_seed([10; 32]);
        let (_, bob_account) = accounts(&rng);

        // Envelope with version 0x02 and no one-time key id field.
        let mut envelope = vec![0x02];
        envelope.push(0x12);
        envelope.push(32);
        envelope.extend_from_slice(&[0x22; 32]);
        envelope.push(0x1A);
        envelope.push(32);
        envelope.extend_from_slice(&[0x11; 32]);
        envelope.push(0x22);
        envelope.push(4);
        envelope.extend_from_slice(&[0x33; 4]);

        let result = Session::new_inbound(&bob_account, &envelope);
        assert!(matches!(result, Err(SessionError::BadMessageFormat)));

        // Garbage input fails the same way.
        let result = Session::new_inbound(&bob_account, b"\x03garbage");
        assert!(matches!(result, Err(SessionError::BadMessageFormat)));
    }

    #[test]
    fn tampered_message_sets_last_error_and_session_recovers() {
        let rng = Rng::from_seed([11; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (message_type, message) = encrypt(&mut alice, &rng, b"hello");
        let mut bob = Session::new_inbound(&bob_account, &message).unwrap();

        let mut tampered = message.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;

        let result = decrypt(&mut bob, message_type, &tampered);
        assert!(matches!(
            result,
            Err(SessionError::Ratchet(
                crate::ratchet::RatchetError::BadMessageMac
            ))
        ));
        assert_eq!(bob.last_error(), ErrorCode::BadMessageMac);
        // The failure did not latch the session.
        assert_eq!(bob.encrypt_message_type(), MessageType::PreKey);

        bob.clear_last_error();
        assert_eq!(bob.last_error(), ErrorCode::Success);

        assert_eq!(decrypt(&mut bob, message_type, &message).unwrap(), b"hello");
        assert_eq!(bob.encrypt_message_type(), MessageType::Message);
    }

    #[test]
    fn long_interleaved_conversation() {
        let rng = Rng::from_seed([12; 32]);
        let (alice_account, bob_account) = accounts(&rng);

        let mut alice = outbound_session(&rng, &alice_account, &bob_account);
        let (message_type, message) = encrypt(&mut alice, &rng, b"round 0");
        let mut bob = Session::new_inbound(&bob_account, &message).unwrap();
        assert_eq!(
            decrypt(&mut bob, message_type, &message).unwrap(),
            b"round 0"
        );

        for round in 1u32..20 {
            let payload = format!("round {round}");
            let (sender, receiver) = if round % 2 == 0 {
                (&mut alice, &mut bob)
            } else {
                (&mut bob, &mut alice)
            };
            let (message_type, message) = encrypt(sender, &rng, payload.as_bytes());
            assert_eq!(
                decrypt(receiver, message_type, &message).unwrap(),
                payload.as_bytes()
            );
        }
    }
}
