//! Credential and access token lifecycle for clients of a HAT
//!
//! A HAT ("Hub of All Things") personal data store authenticates requests with
//! short-lived JWTs. This crate obtains those tokens from long-lived
//! credentials kept in the OS credential store, verifies them, and reuses them
//! until they near expiry or the HAT rejects them.
//!
//! # General Flow
//!
//! An [`AuthProvider`] sits in front of a [`TokenIssuer`][issuer::TokenIssuer] and a
//! [`TokenCache`]. Callers ask the provider for a token each time they make a
//! request:
//!
//! 1. If the cache holds a token that is valid beyond the configured skew
//!    and still passes local verification, it is returned.
//! 2. Otherwise an issuance is started, or joined if one is already running
//!    for the same credential. The issuer reads the credential, exchanges it
//!    with the HAT, and verifies the returned token before it is cached.
//! 3. When the HAT rejects a token, the caller reports it with
//!    [`report_invalid()`][AuthProvider::report_invalid()] so the next call
//!    issues a fresh one.
//!
//! ```
//! use hat_tokens::{
//!     config::HatDomain, hat::HatTokenIssuer, store::InMemoryCredentialStore, AuthProvider,
//!     CredentialIdRef,
//! };
//!
//! # async fn run() -> Result<(), hat_tokens::AuthError> {
//! let store = InMemoryCredentialStore::new().with_credential("alice", "correct horse");
//! let issuer = HatTokenIssuer::new(store, HatDomain::default());
//! let provider = AuthProvider::new(issuer);
//!
//! let token = provider
//!     .authorize(CredentialIdRef::from_str("alice"))
//! # ;/* Commented out due to this trying to interact with the world.
//!     .await?;
//!
//! tracing::info!(
//!     token.expiry = token.expiry().0,
//!     "obtained owner token"
//! );
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `keyring` (default): A [`CredentialStore`][store::CredentialStore] backed by the
//!   platform's secret service.
//! * `http` (default): Issuers that obtain owner and application tokens from a HAT.
//! * `blocking`: A HAT issuer built on `reqwest`'s blocking client, for use with
//!   [`blocking::AuthProvider`].
//! * `pem`: Fetches a HAT's public key when none has been trusted up front. Requires
//!   OpenSSL.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod blocking;
mod braids;
pub mod cache;
pub mod config;
pub mod error;
#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub mod hat;
pub mod issuer;
mod provider;
pub mod store;
mod tokens;
mod verifier;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use cache::TokenCache;
pub use config::{AuthConfig, HatDomain, TransportMode};
pub use error::{AuthError, InvalidToken, StoreError};
pub use provider::AuthProvider;
pub use tokens::{AccessToken, HatClaims, TokenStatus};
pub use verifier::TokenVerifier;

/// The header carrying a HAT access token, in requests and in responses
pub const TOKEN_HEADER: &str = "x-auth-token";
