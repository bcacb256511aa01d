// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local key store the session borrows during establishment.
//!
//! An account holds the long-lived identity key pair and a set of one-time keys, each under a
//! stable numeric identifier. Hosts publish the public halves, look secrets up by id when an
//! inbound session arrives and remove a one-time key once it has been consumed.
//!
//! Key rotation policy and storage at rest are host concerns; the account state is serializable
//! so it can be embedded into whatever format the host checkpoints with.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::x25519::{KeyPair, PublicKey, X25519Error};
use crate::crypto::{Rng, RngError};

/// Stable numeric identifier of a key, unique within one account.
pub type KeyId = u32;

/// Key pair stored under an account-assigned identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalKey {
    id: KeyId,
    key: KeyPair,
}

impl LocalKey {
    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn key(&self) -> &KeyPair {
        &self.key
    }
}

/// Public identity key together with its account-assigned identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKey {
    id: KeyId,
    key: PublicKey,
}

impl IdentityKey {
    pub fn new(id: KeyId, key: PublicKey) -> Self {
        Self { id, key }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }
}

/// Public key of the peer together with the identifier the peer advertised for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKey {
    id: KeyId,
    key: PublicKey,
}

impl RemoteKey {
    pub fn new(id: KeyId, key: PublicKey) -> Self {
        Self { id, key }
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }
}

/// Local account: identity key pair plus one-time keys, addressable by id.
///
/// Identifiers are assigned sequentially starting at 1; 0 never names a key and can serve as an
/// "unknown" sentinel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    identity_key: LocalKey,
    one_time_keys: Vec<LocalKey>,
    next_key_id: KeyId,
}

impl Account {
    /// Creates an account with a freshly generated identity key.
    pub fn new(rng: &Rng) -> Result<Self, AccountError> {
        let identity_key = LocalKey {
            id: 1,
            key: KeyPair::from_seed(rng.random_array()?)?,
        };

        Ok(Self {
            identity_key,
            one_time_keys: Vec::new(),
            next_key_id: 2,
        })
    }

    pub fn identity_key(&self) -> &LocalKey {
        &self.identity_key
    }

    /// Generates `count` one-time keys under fresh identifiers.
    pub fn generate_one_time_keys(&mut self, count: usize, rng: &Rng) -> Result<(), AccountError> {
        for _ in 0..count {
            self.one_time_keys.push(LocalKey {
                id: self.next_key_id,
                key: KeyPair::from_seed(rng.random_array()?)?,
            });
            self.next_key_id += 1;
        }
        Ok(())
    }

    /// Returns the one-time key stored under `id`, if any.
    pub fn lookup_key(&self, id: KeyId) -> Option<&LocalKey> {
        self.one_time_keys.iter().find(|key| key.id == id)
    }

    /// Removes a one-time key after it has been consumed by an inbound session. Returns whether
    /// the key was present.
    pub fn remove_one_time_key(&mut self, id: KeyId) -> bool {
        match self.one_time_keys.iter().position(|key| key.id == id) {
            Some(position) => {
                self.one_time_keys.remove(position);
                true
            }
            None => false,
        }
    }

    /// Public halves of all stored one-time keys, in the form a peer receives them.
    pub fn one_time_keys(&self) -> Vec<RemoteKey> {
        self.one_time_keys
            .iter()
            .map(|key| RemoteKey {
                id: key.id,
                key: *key.key.public_key(),
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    X25519(#[from] X25519Error),
}

#[cfg(test)]
mod tests {
    use crate::crypto::Rng;

    use super::Account;

    #[test]
    fn one_time_key_ids_are_unique_and_sequential() {
        let rng = Rng::from_seed([1; 32]);

        let mut account = Account::new(&rng).unwrap();
        account.generate_one_time_keys(3, &rng).unwrap();

        let published = account.one_time_keys();
        assert_eq!(published.len(), 3);
        assert_eq!(published[0].id(), 2);
        assert_eq!(published[1].id(), 3);
        assert_eq!(published[2].id(), 4);

        // Published halves match the stored secrets.
        for key in &published {
            let local = account.lookup_key(key.id()).unwrap();
            assert_eq!(local.key().public_key(), key.key());
        }
    }

    #[test]
    fn lookup_after_removal() {
        let rng = Rng::from_seed([2; 32]);

        let mut account = Account::new(&rng).unwrap();
        account.generate_one_time_keys(2, &rng).unwrap();

        assert!(account.lookup_key(2).is_some());
        assert!(account.remove_one_time_key(2));
        assert!(account.lookup_key(2).is_none());
        assert!(!account.remove_one_time_key(2));

        // The other key is untouched.
        assert!(account.lookup_key(3).is_some());

        // Identity key is never addressable as a one-time key.
        assert!(account.lookup_key(1).is_none());
    }
}
