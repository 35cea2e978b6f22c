use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use aliri::{
    jwa,
    jwt::{self, BasicHeaders},
    Jwk, Jwt,
};
use aliri_base64::Base64Url;
use aliri_clock::{Clock, DurationSecs, UnixTime};
use async_trait::async_trait;

use crate::{
    blocking::BlockingTokenIssuer, error::InvalidToken, issuer::TokenIssuer, AccessToken,
    AuthError, CredentialId, CredentialIdRef, HatClaims, TokenVerifier,
};

pub const ISSUER: &str = "testing.hubat.net";
pub const HMAC_SECRET: &[u8] = b"a-thoroughly-unguessable-test-key";

/// A clock whose time is shared between clones and only moves when told to
#[derive(Clone, Debug, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(time: UnixTime) -> Self {
        Self(Arc::new(AtomicU64::new(time.0)))
    }

    pub fn advance(&self, by: DurationSecs) {
        self.0.fetch_add(by.0, Ordering::SeqCst);
    }

    pub fn set(&self, time: UnixTime) {
        self.0.store(time.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTime {
        UnixTime(self.0.load(Ordering::SeqCst))
    }
}

pub fn issuer() -> &'static jwt::IssuerRef {
    jwt::IssuerRef::from_str(ISSUER)
}

pub fn signing_key() -> Jwk {
    Jwk::from(jwa::Hmac::new(Base64Url::from_raw(HMAC_SECRET.to_vec())))
        .with_algorithm(jwa::Algorithm::HS256)
}

pub fn verifier(clock: ManualClock) -> TokenVerifier<ManualClock> {
    let verifier = TokenVerifier::new()
        .with_algorithm(jwa::Algorithm::HS256)
        .with_clock(clock);
    verifier.trust(jwt::Issuer::from_static(ISSUER), signing_key());
    verifier
}

pub fn mint(claims: &HatClaims) -> Jwt {
    mint_with(claims, &signing_key())
}

pub fn mint_with(claims: &HatClaims, key: &Jwk) -> Jwt {
    Jwt::try_from_parts_with_signature(&BasicHeaders::new(jwa::Algorithm::HS256), claims, key)
        .expect("test tokens are always signable")
}

pub fn owner_claims(sub: &str, issued: UnixTime, lifetime: DurationSecs) -> HatClaims {
    HatClaims::new()
        .with_subject(sub)
        .with_issuer(ISSUER)
        .with_access_scope("owner")
        .with_issued_at(issued)
        .with_expiration(issued + lifetime)
}

/// What a fake issuer should do on its next issuance for an id
#[derive(Clone, Debug)]
pub enum Outcome {
    Issue { lifetime: DurationSecs },
    Fail(AuthError),
}

/// A token issuer that mints HS256 tokens locally and counts its issuances
pub struct FakeIssuer {
    verifier: TokenVerifier<ManualClock>,
    clock: ManualClock,
    issued: AtomicUsize,
    trusting: AtomicBool,
    delay: Duration,
    outcomes: Mutex<HashMap<CredentialId, Outcome>>,
}

impl FakeIssuer {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            verifier: verifier(clock.clone()),
            clock,
            issued: AtomicUsize::new(0),
            trusting: AtomicBool::new(true),
            delay: Duration::ZERO,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn set_outcome(&self, id: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(CredentialId::from(id), outcome);
    }

    /// Makes every subsequent local verification fail
    pub fn distrust_all(&self) {
        self.trusting.store(false, Ordering::SeqCst);
    }

    fn verify_now(&self, token: &AccessToken) -> bool {
        self.trusting.load(Ordering::SeqCst) && self.verifier.verify(token)
    }

    pub fn issuances(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn mint_for(&self, id: &CredentialIdRef, lifetime: DurationSecs) -> Jwt {
        mint(&owner_claims(id.as_str(), self.clock.now(), lifetime))
    }

    fn issue_now(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(Outcome::Issue {
                lifetime: DurationSecs(3_600),
            });

        match outcome {
            Outcome::Issue { lifetime } => {
                // Vary a claim so that successive tokens differ
                let claims = owner_claims(id.as_str(), self.clock.now(), lifetime)
                    .with_application(format!("issuance-{}", n));
                Ok(self.verifier.decode(mint(&claims), issuer())?)
            }
            Outcome::Fail(err) => Err(err),
        }
    }
}

#[async_trait]
impl TokenIssuer for FakeIssuer {
    async fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.issue_now(id)
    }

    fn verify(&self, token: &AccessToken) -> bool {
        self.verify_now(token)
    }

    fn decode(&self, _id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken> {
        self.verifier.decode(value, issuer())
    }
}

impl BlockingTokenIssuer for FakeIssuer {
    fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.issue_now(id)
    }

    fn verify(&self, token: &AccessToken) -> bool {
        self.verify_now(token)
    }

    fn decode(&self, _id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken> {
        self.verifier.decode(value, issuer())
    }
}
