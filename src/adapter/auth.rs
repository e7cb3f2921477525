//! Client authentication

use russh::keys::PublicKey;

/// Decides whether a principal/key pair may connect
pub trait Authenticator: Send + Sync {
    fn check(&self, principal: &str, key: &PublicKey) -> bool;
}

/// Accepts exactly one principal presenting exactly one key
#[derive(Debug, Clone)]
pub struct SingleKeyAuthenticator {
    user: String,
    key: PublicKey,
}

impl SingleKeyAuthenticator {
    pub fn new(user: impl Into<String>, key: PublicKey) -> Self {
        Self {
            user: user.into(),
            key,
        }
    }
}

impl Authenticator for SingleKeyAuthenticator {
    fn check(&self, principal: &str, key: &PublicKey) -> bool {
        // Comments are not part of the key material.
        principal == self.user && key.key_data() == self.key.key_data()
    }
}
