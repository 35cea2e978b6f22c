//! Token issuers

use std::sync::Arc;

use aliri::Jwt;
use async_trait::async_trait;

use crate::{error::InvalidToken, AccessToken, AuthError, CredentialIdRef};

/// An asynchronous source of freshly issued access tokens
///
/// Issuers never retry; retry policy belongs to the caller.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Exchanges the credential registered under `id` for a new access token
    ///
    /// # Errors
    ///
    /// * [`AuthError::NotFound`] or [`AuthError::StoreUnavailable`] if the
    ///   credential cannot be read
    /// * [`AuthError::IssuanceFailed`] if the token endpoint returns a
    ///   non-success status
    /// * [`AuthError::InvalidToken`] if the returned token is malformed or
    ///   fails verification
    async fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError>;

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

#[async_trait]
impl<I: TokenIssuer + ?Sized> TokenIssuer for Arc<I> {
    async fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        I::issue(self, id).await
    }

    fn verify(&self, token: &AccessToken) -> bool {
        I::verify(self, token)
    }

    fn decode(&self, id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken> {
        I::decode(self, id, value)
    }
}
