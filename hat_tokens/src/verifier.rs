use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use aliri::{
    jwa,
    jwt::{self, BasicHeaders},
    Jwk, Jwt, JwtRef,
};
use aliri_clock::{Clock, System, UnixTime};

use crate::{error::InvalidToken, AccessToken, HatClaims};

/// Local verification of access tokens against trusted issuer keys
///
/// Each issuer (for a HAT, its domain) has exactly one trusted key. Tokens
/// are verified for signature, algorithm, and issuer by the `aliri` core
/// validator; expiry is checked separately against this verifier's clock so
/// that it agrees with the token cache's view of time.
pub struct TokenVerifier<C = System> {
    keys: RwLock<HashMap<jwt::Issuer, Arc<Jwk>>>,
    algorithms: Vec<jwa::Algorithm>,
    clock: C,
}

impl TokenVerifier<System> {
    /// Constructs a verifier with no trusted keys
    ///
    /// Only `RS256`, the algorithm HATs sign with, is approved until other
    /// algorithms are added with [`with_algorithm()`][Self::with_algorithm()].
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            algorithms: vec![jwa::Algorithm::RS256],
            clock: System,
        }
    }
}

impl Default for TokenVerifier<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> TokenVerifier<C> {
    /// Approves an additional signing algorithm
    pub fn with_algorithm(mut self, alg: jwa::Algorithm) -> Self {
        if !self.algorithms.contains(&alg) {
            self.algorithms.push(alg);
        }
        self
    }

    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenVerifier<D> {
        TokenVerifier {
            keys: self.keys,
            algorithms: self.algorithms,
            clock,
        }
    }

    /// Trusts `key` for tokens issued by `issuer`, replacing any prior key
    pub fn trust(&self, issuer: jwt::Issuer, key: Jwk) {
        tracing::debug!(%issuer, key.alg = ?key.algorithm(), "trusting issuer key");
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(issuer, Arc::new(key));
    }

    /// Whether a key is trusted for `issuer`
    pub fn is_trusted(&self, issuer: &jwt::IssuerRef) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(issuer)
    }

    fn key_for(&self, issuer: &jwt::IssuerRef) -> Result<Arc<Jwk>, InvalidToken> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(issuer)
            .cloned()
            .ok_or_else(|| InvalidToken::UntrustedIssuer(issuer.to_owned()))
    }

    fn verify_claims(
        &self,
        value: &JwtRef,
        issuer: &jwt::IssuerRef,
    ) -> Result<HatClaims, InvalidToken> {
        let key = self.key_for(issuer)?;

        let validator = jwt::CoreValidator::default()
            .ignore_expiration()
            .extend_approved_algorithms(self.algorithms.iter().copied())
            .require_issuer(issuer.to_owned());

        let validated: jwt::Validated<HatClaims, BasicHeaders> = value.verify(&*key, &validator)?;
        let (_, claims) = validated.extract();
        Ok(claims)
    }
}

impl<C: Clock> TokenVerifier<C> {
    /// Verifies a raw token expected to come from `issuer`
    ///
    /// # Errors
    ///
    /// Fails if no key is trusted for `issuer`, if the signature, algorithm,
    /// or issuer are rejected, if `sub` or `exp` are absent, if the token
    /// expires before it was issued, if its `nbf` has not been reached, or if
    /// it has already expired.
    pub fn decode(&self, value: Jwt, issuer: &jwt::IssuerRef) -> Result<AccessToken, InvalidToken> {
        let claims = self.verify_claims(&value, issuer)?;
        let now = self.clock.now();
        let token = AccessToken::from_verified(value, claims, now)?;

        check_window(token.claims(), token.expiry(), now)?;
        Ok(token)
    }

    /// Checks that a token is trustworthy as of now
    ///
    /// This is a purely local check: the token's signature is re-verified
    /// against the issuer's trusted key, its signed expiry must match the
    /// expiry it was originally recorded with, and the current time must be
    /// at or after any `nbf` and before that expiry.
    pub fn verify(&self, token: &AccessToken) -> bool {
        match self.check(token) {
            Ok(()) => true,
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    token.expiry = token.expiry().0,
                    "token failed local verification"
                );
                false
            }
        }
    }

    fn check(&self, token: &AccessToken) -> Result<(), InvalidToken> {
        let issuer = token.issuer().ok_or(InvalidToken::MissingClaim("iss"))?;
        let claims = self.verify_claims(token.value(), issuer)?;

        if jwt::CoreClaims::exp(&claims) != Some(token.expiry()) {
            return Err(InvalidToken::ExpiryMismatch);
        }

        check_window(&claims, token.expiry(), self.clock.now())
    }
}

/// Not-before and expiry are judged against the verifier's clock, not the
/// system clock the core validator would use
fn check_window(claims: &HatClaims, expiry: UnixTime, now: UnixTime) -> Result<(), InvalidToken> {
    if jwt::CoreClaims::nbf(claims).map_or(false, |nbf| now < nbf) {
        return Err(InvalidToken::NotYetValid);
    }

    if now >= expiry {
        return Err(InvalidToken::Expired);
    }

    Ok(())
}

impl<C: fmt::Debug> fmt::Debug for TokenVerifier<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TokenVerifier")
            .field("issuers", &keys.keys().collect::<Vec<_>>())
            .field("algorithms", &self.algorithms)
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use aliri_base64::Base64Url;
    use aliri_clock::{DurationSecs, UnixTime};
    use color_eyre::Result;

    use super::*;
    use crate::test_util::{self, issuer, mint, mint_with, owner_claims, ManualClock};

    const START: UnixTime = UnixTime(1_700_000_000);

    fn setup() -> (ManualClock, TokenVerifier<ManualClock>) {
        let clock = ManualClock::new(START);
        let verifier = test_util::verifier(clock.clone());
        (clock, verifier)
    }

    #[test]
    fn decodes_a_well_formed_token() -> Result<()> {
        let (_, verifier) = setup();
        let value = mint(&owner_claims("1-owner", START, DurationSecs(3_600)));

        let token = verifier.decode(value, issuer())?;

        assert_eq!(token.subject().unwrap().as_str(), "1-owner");
        assert_eq!(token.issued(), START);
        assert_eq!(token.expiry(), START + DurationSecs(3_600));
        assert_eq!(token.claims().access_scope(), Some("owner"));
        Ok(())
    }

    #[test]
    fn rejects_signature_from_another_key() {
        let (_, verifier) = setup();
        let other = Jwk::from(jwa::Hmac::new(Base64Url::from_raw(b"not-the-trusted-key".to_vec())))
            .with_algorithm(jwa::Algorithm::HS256);
        let value = mint_with(&owner_claims("1-owner", START, DurationSecs(60)), &other);

        assert!(matches!(
            verifier.decode(value, issuer()),
            Err(InvalidToken::Rejected(_))
        ));
    }

    #[test]
    fn rejects_unexpected_issuer() {
        let (_, verifier) = setup();
        let claims = owner_claims("1-owner", START, DurationSecs(60)).with_issuer("evil.example");

        assert!(matches!(
            verifier.decode(mint(&claims), issuer()),
            Err(InvalidToken::Rejected(_))
        ));
    }

    #[test]
    fn rejects_untrusted_issuer() {
        let (_, verifier) = setup();
        let value = mint(&owner_claims("1-owner", START, DurationSecs(60)));

        assert!(matches!(
            verifier.decode(value, jwt::IssuerRef::from_str("unknown.hubat.net")),
            Err(InvalidToken::UntrustedIssuer(_))
        ));
    }

    #[test]
    fn rejects_unapproved_algorithm() {
        let clock = ManualClock::new(START);
        let verifier = TokenVerifier::new().with_clock(clock);
        verifier.trust(issuer().to_owned(), test_util::signing_key());
        let value = mint(&owner_claims("1-owner", START, DurationSecs(60)));

        assert!(matches!(
            verifier.decode(value, issuer()),
            Err(InvalidToken::Rejected(_))
        ));
    }

    #[test]
    fn rejects_already_expired_token() {
        let (_, verifier) = setup();
        let value = mint(&owner_claims(
            "1-owner",
            UnixTime(START.0 - 120),
            DurationSecs(60),
        ));

        assert!(matches!(
            verifier.decode(value, issuer()),
            Err(InvalidToken::Expired)
        ));
    }

    mod not_before {
        use super::*;

        fn claims() -> HatClaims {
            owner_claims("1-owner", START, DurationSecs(3_600))
                .with_not_before(START + DurationSecs(600))
        }

        #[test]
        fn decode_rejects_token_before_its_nbf() {
            let (_, verifier) = setup();

            assert!(matches!(
                verifier.decode(mint(&claims()), issuer()),
                Err(InvalidToken::NotYetValid)
            ));
        }

        #[test]
        fn decode_accepts_token_once_nbf_is_reached() -> Result<()> {
            let (clock, verifier) = setup();
            clock.set(START + DurationSecs(600));

            let token = verifier.decode(mint(&claims()), issuer())?;

            assert!(verifier.verify(&token));
            Ok(())
        }

        #[test]
        fn verify_fails_when_clock_falls_back_before_nbf() -> Result<()> {
            let (clock, verifier) = setup();
            clock.set(START + DurationSecs(601));
            let token = verifier.decode(mint(&claims()), issuer())?;

            clock.set(START + DurationSecs(599));

            assert!(!verifier.verify(&token));
            Ok(())
        }
    }

    #[test]
    fn verify_is_stable_until_time_passes_expiry() -> Result<()> {
        let (clock, verifier) = setup();
        let token = verifier.decode(
            mint(&owner_claims("1-owner", START, DurationSecs(60))),
            issuer(),
        )?;

        assert!(verifier.verify(&token));
        assert!(verifier.verify(&token));

        clock.advance(DurationSecs(59));
        assert!(verifier.verify(&token));

        clock.advance(DurationSecs(1));
        assert!(!verifier.verify(&token));
        assert!(!verifier.verify(&token));
        Ok(())
    }

    #[test]
    fn verify_fails_once_issuer_key_is_replaced() -> Result<()> {
        let (_, verifier) = setup();
        let token = verifier.decode(
            mint(&owner_claims("1-owner", START, DurationSecs(60))),
            issuer(),
        )?;

        let rotated = Jwk::from(jwa::Hmac::new(Base64Url::from_raw(b"rotated-key".to_vec())))
            .with_algorithm(jwa::Algorithm::HS256);
        verifier.trust(issuer().to_owned(), rotated);

        assert!(!verifier.verify(&token));
        Ok(())
    }
}
