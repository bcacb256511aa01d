// SPDX-License-Identifier: MIT OR Apache-2.0

//! `pairwise-session` provides session establishment and message encryption for
//! double-ratchet-style 1:1 end-to-end encrypted messaging.
//!
//! Given a long-term identity key pair on each side and a one-time key published by the
//! responder, a [`Session`] derives a shared root secret via a triple Diffie-Hellman handshake
//! and from it an unbounded sequence of authenticated, forward-secret messages in either
//! direction. The initiator starts sending immediately: until the responder has answered, every
//! outgoing message is a *prekey message* carrying the handshake material needed to bootstrap
//! the responder's side, after which both sides exchange bare ratchet messages.
//!
//! The crate is transport-agnostic and does no I/O. Randomness is supplied by the caller (the
//! bundled [`Rng`] is one possible source), which keeps every operation deterministic for a
//! given input. Sessions can be serialized ("pickled") and restored byte-exactly, so hosts can
//! checkpoint them into their own storage.
//!
//! Authenticating the responder's identity key, transporting messages and their
//! [`MessageType`], and deduplicating one-time keys across inbound sessions are host concerns.
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use pairwise_session::{Account, MessageType, Rng, Session};
//!
//! let rng = Rng::default();
//!
//! let alice_account = Account::new(&rng)?;
//! let mut bob_account = Account::new(&rng)?;
//! bob_account.generate_one_time_keys(1, &rng)?;
//! let bob_one_time_key = bob_account.one_time_keys()[0];
//!
//! // Alice initiates against Bob's published keys and sends a first, prekey-framed message.
//! let random: [u8; 64] = rng.random_array()?;
//! let mut alice = Session::new_outbound(
//!     &alice_account,
//!     bob_account.identity_key().key().public_key(),
//!     &bob_one_time_key,
//!     &random,
//! )?;
//!
//! assert_eq!(alice.encrypt_message_type(), MessageType::PreKey);
//! let random = rng.random_vec(alice.encrypt_random_length())?;
//! let mut message = vec![0u8; alice.encrypt_message_length(5)];
//! let written = alice.encrypt(b"hello", &random, &mut message)?;
//!
//! // Bob bootstraps his side from the envelope, then decrypts it.
//! let mut bob = Session::new_inbound(&bob_account, &message[..written])?;
//! bob_account.remove_one_time_key(bob_one_time_key.id());
//!
//! let mut plaintext =
//!     vec![0u8; bob.decrypt_max_plaintext_length(MessageType::PreKey, &message[..written])?];
//! let written = bob.decrypt(MessageType::PreKey, &message[..written], &mut plaintext)?;
//! assert_eq!(&plaintext[..written], b"hello");
//! # Ok(())
//! # }
//! ```
mod account;
mod crypto;
mod message;
mod pickle;
mod ratchet;
mod session;

pub use account::{Account, AccountError, IdentityKey, KeyId, LocalKey, RemoteKey};
pub use crypto::x25519::{KeyPair, PublicKey, SecretKey, X25519Error, KEY_SIZE};
pub use crypto::{Rng, RngError};
pub use pickle::PickleError;
pub use ratchet::{Ratchet, RatchetError, SHARED_SECRET_LENGTH};
pub use session::{ErrorCode, MessageType, Session, SessionError};
