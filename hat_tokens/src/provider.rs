//! The asynchronous authorization facade

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use aliri::Jwt;
use aliri_clock::{Clock, DurationSecs, System};
use futures::future::{self, BoxFuture, FutureExt, Shared};

use crate::{
    cache::TokenCache, config::AuthConfig, error::InvalidToken, issuer::TokenIssuer, AccessToken,
    AuthError, CredentialId, CredentialIdRef,
};

type Flight = Shared<BoxFuture<'static, Result<Arc<AccessToken>, AuthError>>>;
type InFlight = Mutex<HashMap<CredentialId, Flight>>;

/// Hands out valid access tokens, issuing new ones only when needed
///
/// Concurrent callers asking for the same credential share a single
/// issuance. The issuance runs on its own task, so a caller that stops
/// waiting does not cancel it, and its result still lands in the cache.
/// Different credentials are issued independently.
///
/// Cloning the provider is cheap and every clone shares the same cache.
pub struct AuthProvider<I, C = System> {
    inner: Arc<Inner<I, C>>,
}

struct Inner<I, C> {
    issuer: I,
    cache: TokenCache<C>,
    cache_enabled: bool,
    in_flight: InFlight,
}

impl<I, C> Clone for AuthProvider<I, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I> AuthProvider<I, System> {
    /// Constructs a provider with a default cache
    pub fn new(issuer: I) -> Self {
        Self::with_cache(issuer, TokenCache::new())
    }

    /// Constructs a provider that never reuses a token
    ///
    /// Issuances are still shared between concurrent callers.
    pub fn uncached(issuer: I) -> Self {
        Self::build(issuer, TokenCache::new(), false)
    }

    /// Constructs a provider with the skew and caching behavior from `config`
    pub fn from_config(issuer: I, config: &AuthConfig) -> Self {
        let cache = TokenCache::new().with_skew(DurationSecs(config.skew_secs()));
        Self::build(issuer, cache, config.cache_enabled())
    }
}

impl<I, C> AuthProvider<I, C> {
    /// Constructs a provider around an existing cache
    pub fn with_cache(issuer: I, cache: TokenCache<C>) -> Self {
        Self::build(issuer, cache, true)
    }

    fn build(issuer: I, cache: TokenCache<C>, cache_enabled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                issuer,
                cache,
                cache_enabled,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The token cache backing this provider
    pub fn cache(&self) -> &TokenCache<C> {
        &self.inner.cache
    }

    /// The issuer used to obtain new tokens
    pub fn issuer(&self) -> &I {
        &self.inner.issuer
    }

    /// Discards the cached token for `id`
    ///
    /// Called when the server rejects a token, so that the next call to
    /// [`authorize()`][Self::authorize()] issues a new one.
    pub fn report_invalid(&self, id: &CredentialIdRef) {
        tracing::warn!(credential.id = %id, "access token reported invalid");
        self.inner.cache.invalidate(id);
    }
}

impl<I, C> AuthProvider<I, C>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Obtains a valid access token for `id`
    ///
    /// # Errors
    ///
    /// Returns the error of the issuance this call started or joined. Errors
    /// are not cached, so a later call will attempt a new issuance.
    #[tracing::instrument(level = "debug", skip(self, id), fields(credential.id = %id))]
    pub async fn authorize(&self, id: &CredentialIdRef) -> Result<Arc<AccessToken>, AuthError> {
        if let Some(token) = self.cached(id) {
            tracing::debug!("using cached token");
            return Ok(token);
        }

        self.flight(id).await
    }

    /// Accepts a token handed back by the server in place of the current one
    ///
    /// The token is verified as if it had just been issued and is kept only
    /// if it expires later than the cached token. Returns whether it was
    /// kept.
    ///
    /// # Errors
    ///
    /// Fails if the token does not pass verification.
    pub fn offer(&self, id: &CredentialIdRef, value: Jwt) -> Result<bool, InvalidToken> {
        if !self.inner.cache_enabled {
            return Ok(false);
        }

        let token = Arc::new(self.inner.issuer.decode(id, value)?);
        let expiry = token.expiry();
        let adopted = self.inner.cache.set_if_later(id, token);
        if adopted {
            tracing::debug!(credential.id = %id, token.expiry = expiry.0, "adopted rotated token");
        }

        Ok(adopted)
    }

    fn cached(&self, id: &CredentialIdRef) -> Option<Arc<AccessToken>> {
        if !self.inner.cache_enabled {
            return None;
        }

        let token = self.inner.cache.get(id)?;
        if self.inner.issuer.verify(&token) {
            Some(token)
        } else {
            tracing::warn!(credential.id = %id, "cached token failed verification, discarding");
            self.inner.cache.evict(id, &token);
            None
        }
    }

    fn flight(&self, id: &CredentialIdRef) -> Flight {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(flight) = in_flight.get(id) {
            tracing::debug!("joining in-flight issuance");
            return flight.clone();
        }

        // A flight may have finished between the cache check and taking the lock
        if let Some(token) = self.cached(id) {
            tracing::debug!("using token from a just-completed issuance");
            return future::ready(Ok(token)).boxed().shared();
        }

        tracing::debug!("starting issuance");
        let inner = Arc::clone(&self.inner);
        let owned = id.to_owned();
        let task = tokio::spawn(async move { inner.issue_and_store(owned).await });

        let flight = async move {
            task.await.unwrap_or_else(|err| {
                tracing::error!(
                    error = (&err as &dyn std::error::Error),
                    "token issuance task did not complete"
                );
                Err(AuthError::Interrupted)
            })
        }
        .boxed()
        .shared();

        in_flight.insert(id.to_owned(), flight.clone());
        flight
    }
}

impl<I: TokenIssuer, C> Inner<I, C> {
    async fn issue_and_store(&self, id: CredentialId) -> Result<Arc<AccessToken>, AuthError> {
        let _landing = Landing {
            in_flight: &self.in_flight,
            id: &id,
        };

        let result = self.issuer.issue(&id).await.map(Arc::new);

        match &result {
            Ok(token) => {
                if self.cache_enabled {
                    self.cache.set(&id, Arc::clone(token));
                }
                tracing::info!(
                    credential.id = %id,
                    token.issued = token.issued().0,
                    token.expiry = token.expiry().0,
                    token.lifetime = token.lifetime().0,
                    "issued new access token"
                );
            }
            Err(error) => {
                tracing::warn!(
                    credential.id = %id,
                    error = (error as &dyn std::error::Error),
                    "token issuance failed"
                );
            }
        }

        result
    }
}

/// Removes a flight from the in-flight map once its task ends, however it ends
struct Landing<'a> {
    in_flight: &'a InFlight,
    id: &'a CredentialIdRef,
}

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.id);
    }
}

impl<I: fmt::Debug, C: fmt::Debug> fmt::Debug for AuthProvider<I, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AuthProvider")
            .field("issuer", &self.inner.issuer)
            .field("cache", &self.inner.cache)
            .field("cache_enabled", &self.inner.cache_enabled)
            .field("in_flight", &in_flight.keys().collect::<Vec<_>>())
            .finish()
    }
}
