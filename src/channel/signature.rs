//! Signing capability for channel updates
//!
//! The protocol treats signatures as an opaque sign/verify capability.
//! `DigestKeyring` is a keyed SHA3 stand-in used by the daemon in
//! development and by tests; production deployments plug in their own
//! `SignatureScheme`.

use crate::types::{Hash, Identity};

use dashmap::DashMap;
use sha3::{Digest, Sha3_256};

/// Verifies participant signatures over a signing digest
pub trait SignatureScheme: Send + Sync {
    fn verify(&self, signer: &str, digest: &Hash, signature: &[u8]) -> bool;
}

/// Produces signatures for one identity
pub trait Signer: Send + Sync {
    fn identity(&self) -> &str;
    fn sign(&self, digest: &Hash) -> Vec<u8>;
}

fn keyed_digest(secret: &[u8], digest: &Hash) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(secret);
    hasher.update(digest);
    hasher.finalize().to_vec()
}

/// Shared-secret keyring: sign and verify with per-identity keys
#[derive(Default)]
pub struct DigestKeyring {
    keys: DashMap<Identity, Vec<u8>>,
}

impl DigestKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, identity: impl Into<Identity>, secret: impl Into<Vec<u8>>) {
        self.keys.insert(identity.into(), secret.into());
    }

    /// Signer for a registered identity
    pub fn signer(&self, identity: &str) -> Option<KeyringSigner> {
        self.keys.get(identity).map(|secret| KeyringSigner {
            identity: identity.to_string(),
            secret: secret.clone(),
        })
    }
}

impl SignatureScheme for DigestKeyring {
    fn verify(&self, signer: &str, digest: &Hash, signature: &[u8]) -> bool {
        match self.keys.get(signer) {
            Some(secret) => keyed_digest(&secret, digest) == signature,
            None => false,
        }
    }
}

pub struct KeyringSigner {
    identity: Identity,
    secret: Vec<u8>,
}

impl Signer for KeyringSigner {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn sign(&self, digest: &Hash) -> Vec<u8> {
        keyed_digest(&self.secret, digest)
    }
}
