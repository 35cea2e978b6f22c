use std::{error, fmt};

use ::keyring::{Entry, Error as KeyringError};

use super::{CredentialStore, DEFAULT_NAMESPACE};
use crate::{error::StoreError, CredentialIdRef, Secret, SecretRef};

/// A credential store backed by the operating system's secret service
///
/// Credentials are stored with the store's namespace as the keyring
/// _service_ and the credential identifier as the keyring _user_, so that
/// they do not collide with secrets that other applications hold on the
/// same machine.
#[derive(Clone, Debug)]
pub struct KeyringCredentialStore {
    namespace: String,
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl KeyringCredentialStore {
    /// Constructs a store that keeps its secrets under `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The keyring service name used for all entries
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn entry(&self, id: &CredentialIdRef) -> Result<Entry, StoreError> {
        Entry::new(&self.namespace, id.as_str()).map_err(|err| map_error(id, err))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn get(&self, id: &CredentialIdRef) -> Result<Secret, StoreError> {
        let secret = self
            .entry(id)?
            .get_password()
            .map_err(|err| map_error(id, err))?;

        tracing::trace!(credential.id = %id, namespace = %self.namespace, "read credential from keyring");
        Ok(Secret::new(secret))
    }

    fn put(&self, id: &CredentialIdRef, secret: &SecretRef) -> Result<(), StoreError> {
        self.entry(id)?
            .set_password(secret.as_str())
            .map_err(|err| map_error(id, err))?;

        tracing::debug!(credential.id = %id, namespace = %self.namespace, "stored credential in keyring");
        Ok(())
    }

    fn delete(&self, id: &CredentialIdRef) -> Result<(), StoreError> {
        match self.entry(id)?.delete_credential() {
            Ok(()) => {
                tracing::debug!(credential.id = %id, namespace = %self.namespace, "deleted credential from keyring");
                Ok(())
            }
            Err(KeyringError::NoEntry) => Ok(()),
            Err(err) => Err(map_error(id, err)),
        }
    }
}

/// A keyring failure with any stored bytes removed
#[derive(Debug)]
struct Redacted(&'static str);

impl fmt::Display for Redacted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl error::Error for Redacted {}

fn map_error(id: &CredentialIdRef, err: KeyringError) -> StoreError {
    match err {
        KeyringError::NoEntry => StoreError::NotFound { id: id.to_owned() },
        // Carries the raw stored bytes, which is the secret itself
        KeyringError::BadEncoding(_) => {
            StoreError::unavailable(id, Redacted("stored credential is not valid UTF-8"))
        }
        KeyringError::TooLong(..) | KeyringError::Invalid(..) => {
            StoreError::unavailable(id, Redacted("keyring rejected the credential attributes"))
        }
        other => StoreError::unavailable(id, other),
    }
}
