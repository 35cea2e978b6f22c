use std::collections::BTreeMap;

use aliri::{
    jwt::{self, CoreClaims},
    Jwt, JwtRef,
};
use aliri_clock::{Clock, DurationSecs, System, UnixTime};
use serde::{Deserialize, Serialize};

use crate::error::InvalidToken;

/// The claims carried by a HAT access token
///
/// Owner tokens carry an `accessScope` of `owner`. Application tokens
/// additionally name the `application` and its version. Any claims not
/// modeled here are preserved in [`extra()`][Self::extra()].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HatClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub: Option<jwt::Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<jwt::Issuer>,
    #[serde(default, skip_serializing_if = "jwt::Audiences::is_empty")]
    aud: jwt::Audiences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nbf: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    application_version: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl HatClaims {
    /// Constructs an empty claim set
    pub fn new() -> Self {
        Self {
            sub: None,
            iss: None,
            aud: jwt::Audiences::empty(),
            exp: None,
            iat: None,
            nbf: None,
            access_scope: None,
            application: None,
            application_version: None,
            extra: BTreeMap::new(),
        }
    }

    /// Sets the subject
    pub fn with_subject(mut self, sub: impl Into<jwt::Subject>) -> Self {
        self.sub = Some(sub.into());
        self
    }

    /// Sets the issuer
    pub fn with_issuer(mut self, iss: impl Into<jwt::Issuer>) -> Self {
        self.iss = Some(iss.into());
        self
    }

    /// Sets the time the token was issued
    pub fn with_issued_at(mut self, iat: UnixTime) -> Self {
        self.iat = Some(iat);
        self
    }

    /// Sets the expiration time
    pub fn with_expiration(mut self, exp: UnixTime) -> Self {
        self.exp = Some(exp);
        self
    }

    /// Sets the time before which the token must not be accepted
    pub fn with_not_before(mut self, nbf: UnixTime) -> Self {
        self.nbf = Some(nbf);
        self
    }

    /// Sets the token's access scope
    pub fn with_access_scope(mut self, scope: impl Into<String>) -> Self {
        self.access_scope = Some(scope.into());
        self
    }

    /// Sets the application the token was issued to
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// The time the token was issued
    pub fn iat(&self) -> Option<UnixTime> {
        self.iat
    }

    /// The token's access scope, `owner` for owner tokens
    pub fn access_scope(&self) -> Option<&str> {
        self.access_scope.as_deref()
    }

    /// The application the token was issued to
    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    /// The version of the application the token was issued to
    pub fn application_version(&self) -> Option<&str> {
        self.application_version.as_deref()
    }

    /// Claims not otherwise modeled
    pub fn extra(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extra
    }
}

impl Default for HatClaims {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreClaims for HatClaims {
    fn nbf(&self) -> Option<UnixTime> {
        self.nbf
    }

    fn exp(&self) -> Option<UnixTime> {
        self.exp
    }

    fn aud(&self) -> &jwt::Audiences {
        &self.aud
    }

    fn iss(&self) -> Option<&jwt::IssuerRef> {
        self.iss.as_deref()
    }

    fn sub(&self) -> Option<&jwt::SubjectRef> {
        self.sub.as_deref()
    }
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and outside of the skew window
    Valid,
    /// The token is still valid, but will expire within the skew window
    Expiring,
    /// The token is no longer valid
    Expired,
}

/// A verified access token along with its lifetime
///
/// Tokens are only ever constructed from claims whose signature has been
/// verified, and always satisfy `expiry > issued`.
#[derive(Clone, Debug)]
pub struct AccessToken {
    value: Jwt,
    issued: UnixTime,
    expiry: UnixTime,
    claims: HatClaims,
}

impl AccessToken {
    pub(crate) fn from_verified(
        value: Jwt,
        claims: HatClaims,
        now: UnixTime,
    ) -> Result<Self, InvalidToken> {
        if claims.sub.is_none() {
            return Err(InvalidToken::MissingClaim("sub"));
        }

        let expiry = claims.exp.ok_or(InvalidToken::MissingClaim("exp"))?;
        let issued = claims.iat.unwrap_or(now);

        if expiry <= issued {
            return Err(InvalidToken::InvalidLifetime);
        }

        Ok(Self {
            value,
            issued,
            expiry,
            claims,
        })
    }

    /// The raw token
    ///
    /// The `Debug` and `Display` output of the returned value is redacted.
    #[inline]
    pub fn value(&self) -> &JwtRef {
        &self.value
    }

    /// The verified claims of the token
    #[inline]
    pub fn claims(&self) -> &HatClaims {
        &self.claims
    }

    /// The subject the token was issued for
    #[inline]
    pub fn subject(&self) -> Option<&jwt::SubjectRef> {
        self.claims.sub()
    }

    /// The issuer of the token, which for a HAT is its domain
    #[inline]
    pub fn issuer(&self) -> Option<&jwt::IssuerRef> {
        self.claims.iss()
    }

    /// The time the token was issued
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// The time the token expires
    #[inline]
    pub fn expiry(&self) -> UnixTime {
        self.expiry
    }

    /// The total lifetime of the token
    #[inline]
    pub fn lifetime(&self) -> DurationSecs {
        self.expiry - self.issued
    }

    /// Whether the token is still valid at `time` with `skew` to spare
    #[inline]
    pub fn is_valid_at(&self, time: UnixTime, skew: DurationSecs) -> bool {
        time + skew < self.expiry
    }

    /// Gets the token's status according to the system clock
    #[inline]
    pub fn token_status(&self, skew: DurationSecs) -> TokenStatus {
        self.token_status_with_clock(skew, &System)
    }

    /// Gets the token's status according to the provided clock
    #[inline]
    pub fn token_status_with_clock<C: Clock>(&self, skew: DurationSecs, clock: &C) -> TokenStatus {
        self.token_status_at(clock.now(), skew)
    }

    /// Gets the token's status as of the provided time
    pub fn token_status_at(&self, time: UnixTime, skew: DurationSecs) -> TokenStatus {
        if self.is_valid_at(time, skew) {
            TokenStatus::Valid
        } else if time < self.expiry {
            TokenStatus::Expiring
        } else {
            TokenStatus::Expired
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        if time < self.expiry {
            self.expiry - time
        } else {
            DurationSecs(0)
        }
    }
}
