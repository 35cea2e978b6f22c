//! Authorization for callers without an async runtime
//!
//! The contract matches [`AuthProvider`][crate::AuthProvider]: one issuance
//! per credential at a time, shared by every caller that arrives while it is
//! running. The first caller performs the issuance on its own thread, and
//! later callers park until it publishes a result.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use aliri::Jwt;
use aliri_clock::{Clock, DurationSecs, System};

use crate::{
    cache::TokenCache, config::AuthConfig, error::InvalidToken, AccessToken, AuthError,
    CredentialId, CredentialIdRef,
};

/// A synchronous source of freshly issued access tokens
///
/// See [`TokenIssuer`][crate::issuer::TokenIssuer] for the meaning of each
/// operation.
pub trait BlockingTokenIssuer: Send + Sync {
    /// Exchanges the credential registered under `id` for a new access token
    ///
    /// # Errors
    ///
    /// As for [`TokenIssuer::issue()`][crate::issuer::TokenIssuer::issue()].
    fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError>;

    /// Checks, without any I/O, that a previously issued token is still
    /// trustworthy
    fn verify(&self, token: &AccessToken) -> bool;

    /// Verifies a raw token presented on behalf of `id`
    ///
    /// # Errors
    ///
    /// Fails if the token would not have been accepted from [`issue()`][Self::issue()].
    fn decode(&self, id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken>;
}

impl<I: BlockingTokenIssuer + ?Sized> BlockingTokenIssuer for Arc<I> {
    fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        I::issue(self, id)
    }

    fn verify(&self, token: &AccessToken) -> bool {
        I::verify(self, token)
    }

    fn decode(&self, id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken> {
        I::decode(self, id, value)
    }
}

type Outcome = Result<Arc<AccessToken>, AuthError>;

/// A one-shot result shared between the issuing thread and its waiters
#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    landed: Condvar,
}

impl Flight {
    fn publish(&self, outcome: Outcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.landed.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> Outcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }

            slot = match deadline {
                None => self
                    .landed
                    .wait(slot)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(AuthError::TimedOut);
                    }
                    self.landed
                        .wait_timeout(slot, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// The blocking counterpart of [`AuthProvider`][crate::AuthProvider]
///
/// Cloning the provider is cheap and every clone shares the same cache.
pub struct AuthProvider<I, C = System> {
    inner: Arc<Inner<I, C>>,
}

struct Inner<I, C> {
    issuer: I,
    cache: TokenCache<C>,
    cache_enabled: bool,
    in_flight: Mutex<HashMap<CredentialId, Arc<Flight>>>,
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
    pub fn report_invalid(&self, id: &CredentialIdRef) {
        tracing::warn!(credential.id = %id, "access token reported invalid");
        self.inner.cache.invalidate(id);
    }
}

enum Role {
    Issue(Arc<Flight>),
    Wait(Arc<Flight>),
    Done(Arc<AccessToken>),
}

impl<I: BlockingTokenIssuer, C: Clock> AuthProvider<I, C> {
    /// Obtains a valid access token for `id`, blocking until one is available
    ///
    /// # Errors
    ///
    /// Returns the error of the issuance this call performed or joined.
    pub fn authorize(&self, id: &CredentialIdRef) -> Result<Arc<AccessToken>, AuthError> {
        self.authorize_inner(id, None)
    }

    /// Obtains a valid access token for `id`, waiting at most `timeout` for
    /// an issuance started by another caller
    ///
    /// A caller that performs the issuance itself is bound by the issuer's
    /// own timeouts instead.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TimedOut`] if the wait elapses. The issuance
    /// continues and will still populate the cache.
    pub fn authorize_timeout(
        &self,
        id: &CredentialIdRef,
        timeout: Duration,
    ) -> Result<Arc<AccessToken>, AuthError> {
        self.authorize_inner(id, Some(timeout))
    }

    /// Accepts a token handed back by the server in place of the current one
    ///
    /// Returns whether the token was kept.
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

    fn authorize_inner(
        &self,
        id: &CredentialIdRef,
        timeout: Option<Duration>,
    ) -> Result<Arc<AccessToken>, AuthError> {
        if let Some(token) = self.cached(id) {
            tracing::debug!(credential.id = %id, "using cached token");
            return Ok(token);
        }

        match self.role(id) {
            Role::Done(token) => Ok(token),
            Role::Wait(flight) => {
                tracing::debug!(credential.id = %id, "joining in-flight issuance");
                flight.wait(timeout)
            }
            Role::Issue(flight) => {
                let landing = Landing {
                    inner: &self.inner,
                    flight: &flight,
                    id,
                };
                let outcome = self.inner.issue_and_store(id);
                landing.land(outcome.clone());
                outcome
            }
        }
    }

    fn role(&self, id: &CredentialIdRef) -> Role {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(flight) = in_flight.get(id) {
            return Role::Wait(Arc::clone(flight));
        }

        // A flight may have finished between the cache check and taking the lock
        if let Some(token) = self.cached(id) {
            return Role::Done(token);
        }

        let flight = Arc::new(Flight::default());
        in_flight.insert(id.to_owned(), Arc::clone(&flight));
        Role::Issue(flight)
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
}

impl<I: BlockingTokenIssuer, C> Inner<I, C> {
    #[tracing::instrument(level = "debug", skip(self, id), fields(credential.id = %id))]
    fn issue_and_store(&self, id: &CredentialIdRef) -> Outcome {
        let result = self.issuer.issue(id).map(Arc::new);

        match &result {
            Ok(token) => {
                if self.cache_enabled {
                    self.cache.set(id, Arc::clone(token));
                }
                tracing::info!(
                    token.issued = token.issued().0,
                    token.expiry = token.expiry().0,
                    token.lifetime = token.lifetime().0,
                    "issued new access token"
                );
            }
            Err(error) => {
                tracing::warn!(
                    error = (error as &dyn std::error::Error),
                    "token issuance failed"
                );
            }
        }

        result
    }
}

/// Publishes the issuing caller's result and retires its flight
///
/// If the issuing caller unwinds before landing, waiters receive
/// [`AuthError::Interrupted`].
struct Landing<'a, I, C> {
    inner: &'a Inner<I, C>,
    flight: &'a Arc<Flight>,
    id: &'a CredentialIdRef,
}

impl<I, C> Landing<'_, I, C> {
    fn land(self, outcome: Outcome) {
        self.flight.publish(outcome);
    }
}

impl<I, C> Drop for Landing<'_, I, C> {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(self.id);
        self.flight.publish(Err(AuthError::Interrupted));
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

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use aliri_clock::UnixTime;
    use color_eyre::Result;

    use super::*;
    use crate::test_util::{FakeIssuer, ManualClock, Outcome as Planned};

    const START: UnixTime = UnixTime(1_700_000_000);

    fn id() -> &'static CredentialIdRef {
        CredentialIdRef::from_str("hat-owner-1")
    }

    fn setup(delay: Duration) -> (ManualClock, AuthProvider<Arc<FakeIssuer>, ManualClock>) {
        let clock = ManualClock::new(START);
        let issuer = Arc::new(FakeIssuer::new(clock.clone()).with_delay(delay));
        let cache = TokenCache::new().with_clock(clock.clone());
        (clock, AuthProvider::with_cache(issuer, cache))
    }

    #[test]
    fn reuses_a_cached_token() -> Result<()> {
        let (_, provider) = setup(Duration::ZERO);

        let first = provider.authorize(id())?;
        let second = provider.authorize(id())?;

        assert_eq!(provider.issuer().issuances(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        Ok(())
    }

    #[test]
    fn report_invalid_forces_reissue() -> Result<()> {
        let (_, provider) = setup(Duration::ZERO);

        provider.authorize(id())?;
        provider.report_invalid(id());
        provider.authorize(id())?;

        assert_eq!(provider.issuer().issuances(), 2);
        Ok(())
    }

    #[test]
    fn reissues_after_expiry() -> Result<()> {
        let (clock, provider) = setup(Duration::ZERO);

        provider.authorize(id())?;
        clock.advance(DurationSecs(3_600));
        provider.authorize(id())?;

        assert_eq!(provider.issuer().issuances(), 2);
        Ok(())
    }

    #[test]
    fn concurrent_cold_callers_share_one_issuance() -> Result<()> {
        let (_, provider) = setup(Duration::from_millis(50));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    provider.authorize(id())
                })
            })
            .collect();

        let tokens = handles
            .into_iter()
            .map(|h| h.join().expect("caller thread panicked"))
            .collect::<Result<Vec<_>, _>>()?;

        assert_eq!(provider.issuer().issuances(), 1);
        assert!(tokens.iter().all(|t| Arc::ptr_eq(t, &tokens[0])));
        Ok(())
    }

    #[test]
    fn failures_reach_waiters_and_are_not_cached() {
        let (_, provider) = setup(Duration::from_millis(50));
        provider.issuer().set_outcome(
            "hat-owner-1",
            Planned::Fail(AuthError::IssuanceFailed {
                status: 503,
                body: "maintenance".into(),
            }),
        );
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let provider = provider.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    provider.authorize(id())
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().expect("caller thread panicked");
            assert!(matches!(result, Err(AuthError::IssuanceFailed { status: 503, .. })));
        }
        assert_eq!(provider.issuer().issuances(), 1);

        assert!(provider.authorize(id()).is_err());
        assert_eq!(provider.issuer().issuances(), 2);
    }

    #[test]
    fn a_waiter_that_times_out_leaves_the_issuance_running() -> Result<()> {
        let (_, provider) = setup(Duration::from_millis(200));

        let issuing = {
            let provider = provider.clone();
            thread::spawn(move || provider.authorize(id()))
        };
        thread::sleep(Duration::from_millis(50));

        let waited = provider.authorize_timeout(id(), Duration::from_millis(10));
        assert!(matches!(waited, Err(AuthError::TimedOut)));

        issuing.join().expect("issuing thread panicked")?;
        assert!(provider.cache().get(id()).is_some());
        assert_eq!(provider.issuer().issuances(), 1);
        Ok(())
    }

    #[test]
    fn waiters_are_released_if_the_issuer_panics() {
        struct Panicking;

        impl BlockingTokenIssuer for Panicking {
            fn issue(&self, _id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
                thread::sleep(Duration::from_millis(100));
                panic!("issuer blew up");
            }

            fn verify(&self, _token: &AccessToken) -> bool {
                false
            }

            fn decode(&self, _id: &CredentialIdRef, _value: Jwt) -> Result<AccessToken, InvalidToken> {
                Err(InvalidToken::Malformed(None))
            }
        }

        let provider = AuthProvider::new(Panicking);

        let issuing = {
            let provider = provider.clone();
            thread::spawn(move || provider.authorize(id()))
        };
        thread::sleep(Duration::from_millis(30));

        let waited = provider.authorize(id());
        assert!(matches!(waited, Err(AuthError::Interrupted)));
        assert!(issuing.join().is_err());
    }

    #[test]
    fn offer_adopts_a_longer_lived_token() -> Result<()> {
        let (clock, provider) = setup(Duration::ZERO);
        provider.authorize(id())?;

        clock.advance(DurationSecs(60));
        let rotated = provider.issuer().mint_for(id(), DurationSecs(3_600));
        assert!(provider.offer(id(), rotated)?);

        provider.authorize(id())?;
        assert_eq!(provider.issuer().issuances(), 1);
        Ok(())
    }
}
