use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use super::CredentialStore;
use crate::{error::StoreError, CredentialId, CredentialIdRef, Secret, SecretRef};

/// A credential store held entirely in process memory
///
/// Useful for tests and for short-lived processes that receive their
/// credentials from the environment.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    secrets: RwLock<HashMap<CredentialId, Secret>>,
}

impl InMemoryCredentialStore {
    /// Constructs an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential to the store
    pub fn with_credential(self, id: impl Into<CredentialId>, secret: impl Into<Secret>) -> Self {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), secret.into());
        self
    }
}

impl std::fmt::Debug for InMemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryCredentialStore")
            .field("ids", &secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get(&self, id: &CredentialIdRef) -> Result<Secret, StoreError> {
        self.secrets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })
    }

    fn put(&self, id: &CredentialIdRef, secret: &SecretRef) -> Result<(), StoreError> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), secret.to_owned());
        Ok(())
    }

    fn delete(&self, id: &CredentialIdRef) -> Result<(), StoreError> {
        self.secrets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_then_delete() {
        let store = InMemoryCredentialStore::new();
        let id = CredentialIdRef::from_str("hat-owner-1");

        store.put(id, SecretRef::from_str("s3cr3t")).unwrap();
        assert_eq!(store.get(id).unwrap().as_str(), "s3cr3t");

        store.delete(id).unwrap();
        assert!(matches!(
            store.get(id),
            Err(StoreError::NotFound { id }) if id.as_str() == "hat-owner-1"
        ));
    }

    #[test]
    fn put_overwrites_existing_secret() {
        let store = InMemoryCredentialStore::new().with_credential("hat-owner-1", "old");
        let id = CredentialIdRef::from_str("hat-owner-1");

        store.put(id, SecretRef::from_str("new")).unwrap();
        assert_eq!(store.get(id).unwrap().as_str(), "new");
    }

    #[test]
    fn delete_is_idempotent() {
        let store = InMemoryCredentialStore::new();
        let id = CredentialIdRef::from_str("never-registered");

        store.delete(id).unwrap();
        store.delete(id).unwrap();
    }

    #[test]
    fn debug_lists_ids_but_not_secrets() {
        let store = InMemoryCredentialStore::new().with_credential("hat-owner-1", "s3cr3t");
        let debug = format!("{:?}", store);

        assert!(debug.contains("hat-owner-1"));
        assert!(!debug.contains("s3cr3t"));
    }
}
