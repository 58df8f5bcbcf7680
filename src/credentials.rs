//! Bearer credential lookup.
//!
//! Session storage belongs to the login flow; the sync engine only needs to
//! read the current bearer token before each request and channel connect.
//! On desktop the token lives in the OS credential store (DPAPI on Windows,
//! Keychain on macOS, Secret Service on Linux) through the `keyring` crate.

use keyring::Entry;
use std::fmt;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::CredentialError;

pub const SERVICE_NAME: &str = "fuel-order-sync";
pub const KEY_BEARER_TOKEN: &str = "bearer_token";

pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Result<Zeroizing<String>, CredentialError>;
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
    key: String,
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new(SERVICE_NAME, KEY_BEARER_TOKEN)
    }
}

impl KeyringCredentials {
    pub fn new(service: &str, key: &str) -> Self {
        Self {
            service: service.to_string(),
            key: key.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, CredentialError> {
        Ok(Entry::new(&self.service, &self.key)?)
    }

    /// Store the token (called by the login flow).
    pub fn store(&self, token: &str) -> Result<(), CredentialError> {
        self.entry()?.set_password(token)?;
        info!(service = %self.service, key = %self.key, "bearer token stored");
        Ok(())
    }

    /// Remove the token. Succeeds when nothing is stored.
    pub fn clear(&self) -> Result<(), CredentialError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialSource for KeyringCredentials {
    fn bearer_token(&self) -> Result<Zeroizing<String>, CredentialError> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Zeroizing::new(token)),
            Err(keyring::Error::NoEntry) => Err(CredentialError::Missing(self.key.clone())),
            Err(e) => {
                warn!(key = %self.key, error = %e, "keyring: failed to read credential");
                Err(e.into())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed token
// ---------------------------------------------------------------------------

/// A token handed over directly, e.g. from `FUEL_SYNC_TOKEN`.
pub struct StaticCredential(Zeroizing<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Zeroizing::new(token.into()))
    }
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticCredential(***)")
    }
}

impl CredentialSource for StaticCredential {
    fn bearer_token(&self) -> Result<Zeroizing<String>, CredentialError> {
        if self.0.trim().is_empty() {
            return Err(CredentialError::Missing(KEY_BEARER_TOKEN.to_string()));
        }
        Ok(self.0.clone())
    }
}
