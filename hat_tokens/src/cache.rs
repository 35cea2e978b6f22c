//! In-memory caching of access tokens

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use aliri_clock::{Clock, DurationSecs, System};

use crate::{AccessToken, CredentialId, CredentialIdRef};

/// The default safety margin subtracted from a token's expiry
pub const DEFAULT_SKEW: DurationSecs = DurationSecs(30);

/// A process-wide cache holding at most one access token per credential
///
/// A cached token is only handed out while `now < expiry - skew`, so that a
/// token is never served that would expire while a request is in flight.
/// Entries are replaced whole, so a reader always observes either the prior
/// token or the new one, never a mix of the two.
pub struct TokenCache<C = System> {
    entries: RwLock<HashMap<CredentialId, Arc<AccessToken>>>,
    skew: DurationSecs,
    clock: C,
}

impl TokenCache<System> {
    /// Constructs an empty cache using the default skew and the system clock
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            skew: DEFAULT_SKEW,
            clock: System,
        }
    }
}

impl Default for TokenCache<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TokenCache<C> {
    /// Sets the safety margin subtracted from each token's expiry
    pub fn with_skew(self, skew: DurationSecs) -> Self {
        Self { skew, ..self }
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenCache<D> {
        TokenCache {
            entries: self.entries,
            skew: self.skew,
            clock,
        }
    }

    /// The safety margin subtracted from each token's expiry
    pub fn skew(&self) -> DurationSecs {
        self.skew
    }

    /// The clock used to judge expiry
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Stores `token` for `id`, replacing any prior entry
    pub fn set(&self, id: &CredentialIdRef, token: Arc<AccessToken>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), token);
    }

    /// Stores `token` for `id` only if it expires later than the current entry
    ///
    /// Returns whether the token was stored.
    pub fn set_if_later(&self, id: &CredentialIdRef, token: Arc<AccessToken>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(id) {
            Some(current) if current.expiry() >= token.expiry() => false,
            _ => {
                entries.insert(id.to_owned(), token);
                true
            }
        }
    }

    /// Removes the entry for `id` only if it is still `token`
    pub(crate) fn evict(&self, id: &CredentialIdRef, token: &Arc<AccessToken>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(id).map_or(false, |current| Arc::ptr_eq(current, token)) {
            entries.remove(id);
        }
    }

    /// Removes the entry for `id`, if any
    pub fn invalidate(&self, id: &CredentialIdRef) {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);

        if removed.is_some() {
            tracing::debug!(credential.id = %id, "invalidated cached token");
        }
    }

    /// Removes every entry
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The number of entries held, including any that have expired
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clock> TokenCache<C> {
    /// Gets the token for `id` if it remains valid beyond the skew window
    pub fn get(&self, id: &CredentialIdRef) -> Option<Arc<AccessToken>> {
        let token = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()?;

        let now = self.clock.now();
        if token.is_valid_at(now, self.skew) {
            Some(token)
        } else {
            tracing::trace!(
                credential.id = %id,
                now = now.0,
                token.expiry = token.expiry().0,
                skew = self.skew.0,
                "cached token is expired or within skew"
            );
            None
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for TokenCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.len())
            .field("skew", &self.skew)
            .field("clock", &self.clock)
            .finish()
    }
}
