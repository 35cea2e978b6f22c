//! Storage for long-lived credentials
//!
//! Secrets are addressed by a [`CredentialId`] and are only ever read by a
//! token issuer when it needs to obtain a new access token.

use std::sync::Arc;

use crate::{error::StoreError, CredentialId, CredentialIdRef, Secret, SecretRef};

mod in_memory;
#[cfg(feature = "keyring")]
mod keyring;

pub use in_memory::InMemoryCredentialStore;
#[cfg(feature = "keyring")]
#[cfg_attr(docsrs, doc(cfg(feature = "keyring")))]
pub use self::keyring::KeyringCredentialStore;

/// The keyring service name under which credentials are stored by default
pub const DEFAULT_NAMESPACE: &str = "hat-sdk";

/// A store of long-lived secrets
///
/// Implementations may be backed by remote or OS-level services, so every
/// operation may block. Asynchronous callers should move calls onto a
/// blocking-capable thread.
pub trait CredentialStore: Send + Sync {
    /// Retrieves the secret registered under `id`
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::NotFound`] if nothing is registered under `id`
    /// and with [`StoreError::Unavailable`] if the store cannot be reached.
    fn get(&self, id: &CredentialIdRef) -> Result<Secret, StoreError>;

    /// Registers `secret` under `id`, replacing any existing value
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::Unavailable`] if the store cannot be reached.
    fn put(&self, id: &CredentialIdRef, secret: &SecretRef) -> Result<(), StoreError>;

    /// Removes the secret registered under `id`
    ///
    /// Removing an absent credential is not an error.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::Unavailable`] if the store cannot be reached.
    fn delete(&self, id: &CredentialIdRef) -> Result<(), StoreError>;
}

impl<S: CredentialStore + ?Sized> CredentialStore for Arc<S> {
    #[inline]
    fn get(&self, id: &CredentialIdRef) -> Result<Secret, StoreError> {
        S::get(self, id)
    }

    #[inline]
    fn put(&self, id: &CredentialIdRef, secret: &SecretRef) -> Result<(), StoreError> {
        S::put(self, id, secret)
    }

    #[inline]
    fn delete(&self, id: &CredentialIdRef) -> Result<(), StoreError> {
        S::delete(self, id)
    }
}

impl<S: CredentialStore + ?Sized> CredentialStore for Box<S> {
    #[inline]
    fn get(&self, id: &CredentialIdRef) -> Result<Secret, StoreError> {
        S::get(self, id)
    }

    #[inline]
    fn put(&self, id: &CredentialIdRef, secret: &SecretRef) -> Result<(), StoreError> {
        S::put(self, id, secret)
    }

    #[inline]
    fn delete(&self, id: &CredentialIdRef) -> Result<(), StoreError> {
        S::delete(self, id)
    }
}

/// Reads a credential from a store on the blocking thread pool
///
/// The credential store is the only blocking I/O boundary besides the token
/// endpoint, so asynchronous issuers route reads through here.
pub(crate) async fn get_blocking<S>(store: &Arc<S>, id: &CredentialIdRef) -> Result<Secret, StoreError>
where
    S: CredentialStore + ?Sized + 'static,
{
    let store = Arc::clone(store);
    let owned: CredentialId = id.to_owned();
    let join_id = owned.clone();

    tokio::task::spawn_blocking(move || store.get(&owned))
        .await
        .map_err(|err| StoreError::unavailable(join_id, err))?
}
