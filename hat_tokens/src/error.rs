//! Errors raised while storing credentials or obtaining access tokens
//!
//! Every error here is `Clone` so that the outcome of a single issuance can be
//! handed to every caller that was waiting on it. None of them ever carry a
//! secret value, and their `Display` output never includes a response body.

use std::{error, sync::Arc};

use aliri::jwt;
use thiserror::Error;

use crate::CredentialId;

/// A boxed, shareable error source
pub type SharedError = Arc<dyn error::Error + Send + Sync + 'static>;

/// An error from a [`CredentialStore`][crate::store::CredentialStore]
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// No credential is registered under the identifier
    #[error("no credential registered for `{id}`")]
    NotFound {
        /// The identifier that was looked up
        id: CredentialId,
    },
    /// The underlying secret service could not be reached
    #[error("credential store unavailable while accessing `{id}`")]
    Unavailable {
        /// The identifier that was being accessed
        id: CredentialId,
        /// The reason the store was unavailable
        #[source]
        source: SharedError,
    },
}

impl StoreError {
    pub(crate) fn unavailable(
        id: impl Into<CredentialId>,
        source: impl error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            id: id.into(),
            source: Arc::new(source),
        }
    }
}

/// Reasons why an access token was rejected locally
#[derive(Clone, Debug, Error)]
pub enum InvalidToken {
    /// The token response was missing fields or was not valid JSON
    #[error("token response was malformed")]
    Malformed(#[source] Option<SharedError>),
    /// The token signature, algorithm, or issuer was rejected
    #[error("token signature or claims were rejected")]
    Rejected(#[source] Arc<aliri::error::JwtVerifyError>),
    /// A claim that must be present was absent
    #[error("token is missing required claim `{0}`")]
    MissingClaim(&'static str),
    /// The token expires at or before the time it was issued
    #[error("token expires before it was issued")]
    InvalidLifetime,
    /// The token has already expired
    #[error("token has expired")]
    Expired,
    /// The token's `nbf` is still in the future
    #[error("token is not yet valid")]
    NotYetValid,
    /// No key is trusted for the token's issuer
    #[error("no trusted key for issuer `{0}`")]
    UntrustedIssuer(jwt::Issuer),
    /// The token's recorded expiry does not match its signed claims
    #[error("token expiry does not match its signed claims")]
    ExpiryMismatch,
}

impl InvalidToken {
    pub(crate) fn malformed(source: impl error::Error + Send + Sync + 'static) -> Self {
        Self::Malformed(Some(Arc::new(source)))
    }
}

impl From<aliri::error::JwtVerifyError> for InvalidToken {
    fn from(err: aliri::error::JwtVerifyError) -> Self {
        Self::Rejected(Arc::new(err))
    }
}

/// An error while authorizing a request
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// No credential is registered under the identifier
    #[error("no credential registered for `{id}`")]
    NotFound {
        /// The identifier that was looked up
        id: CredentialId,
    },
    /// The credential store could not be reached
    #[error("credential store unavailable while accessing `{id}`")]
    StoreUnavailable {
        /// The identifier that was being accessed
        id: CredentialId,
        /// The reason the store was unavailable
        #[source]
        source: SharedError,
    },
    /// The token endpoint rejected the exchange
    #[error("token issuance failed with status {status}")]
    IssuanceFailed {
        /// The HTTP status returned by the token endpoint
        status: u16,
        /// The response body returned by the token endpoint
        body: String,
    },
    /// The issued or cached token failed local verification
    #[error("invalid access token")]
    InvalidToken(#[from] InvalidToken),
    /// The token endpoint could not be reached
    #[error("unable to reach the token endpoint")]
    Transport {
        /// The underlying transport error
        #[source]
        source: SharedError,
    },
    /// The HAT for the credential could not be located
    #[error("HAT location is misconfigured")]
    Config(#[from] ConfigError),
    /// The issuance ended without producing a result
    #[error("token issuance was interrupted")]
    Interrupted,
    /// Gave up waiting on an in-flight issuance
    #[error("timed out waiting for token issuance")]
    TimedOut,
}

impl AuthError {
    /// Whether the caller may reasonably retry the operation
    ///
    /// Server errors, transport errors, and an unavailable store are
    /// considered transient. A missing credential, a client error from the
    /// token endpoint, an invalid token, or a misconfigured domain are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::IssuanceFailed { status, .. } => *status >= 500,
            Self::StoreUnavailable { .. }
            | Self::Transport { .. }
            | Self::Interrupted
            | Self::TimedOut => true,
            Self::NotFound { .. } | Self::InvalidToken(_) | Self::Config(_) => false,
        }
    }

    #[cfg(feature = "http")]
    pub(crate) fn transport(source: impl error::Error + Send + Sync + 'static) -> Self {
        Self::Transport {
            source: Arc::new(source),
        }
    }
}

/// An error in an [`AuthConfig`][crate::config::AuthConfig]
#[derive(Clone, Debug, Error)]
pub enum ConfigError {
    /// The requested transport was not compiled in
    #[error("transport `{0:?}` requires a cargo feature that is not enabled")]
    UnsupportedTransport(crate::config::TransportMode),
    /// A fixed base URL is not an absolute `http` or `https` URL
    #[error("`{0}` is not an absolute http(s) URL")]
    InvalidBaseUrl(String),
    /// A credential id is not usable as a HAT subdomain
    #[error("credential id `{0}` is not a valid subdomain label")]
    InvalidCredentialId(CredentialId),
    /// The HTTP client could not be constructed
    #[error("unable to construct HTTP client")]
    Client(#[source] SharedError),
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::Unavailable { id, source } => Self::StoreUnavailable { id, source },
        }
    }
}
