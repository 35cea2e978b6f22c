use std::fmt;

use aliri::Jwt;
use aliri_clock::{Clock, System};
use async_trait::async_trait;

use super::{ensure_trusted, read_token, sensitive, TOKEN_HEADER};
use crate::{
    config::HatDomain, error::InvalidToken, issuer::TokenIssuer, AccessToken, ApplicationIdRef,
    AuthError, AuthProvider, CredentialId, CredentialIdRef, TokenVerifier,
};

/// Issues application tokens on behalf of a HAT owner
///
/// The credential id passed to [`issue()`][TokenIssuer::issue()] is the
/// application id. Each issuance first obtains an owner token from the owner
/// provider, so the owner token is reused across applications.
pub struct HatAppTokenIssuer<O, OC = System, C = System> {
    client: reqwest::Client,
    owner: AuthProvider<O, OC>,
    owner_id: CredentialId,
    domain: HatDomain,
    verifier: TokenVerifier<C>,
}

impl<O, OC> HatAppTokenIssuer<O, OC, System> {
    /// Constructs an issuer for applications on the HAT of `owner_id`
    pub fn new(owner: AuthProvider<O, OC>, owner_id: impl Into<CredentialId>, domain: HatDomain) -> Self {
        Self {
            client: reqwest::Client::new(),
            owner,
            owner_id: owner_id.into(),
            domain,
            verifier: TokenVerifier::new(),
        }
    }
}

impl<O, OC, C> HatAppTokenIssuer<O, OC, C> {
    /// Sets the HTTP client used to reach the HAT
    pub fn with_client(self, client: reqwest::Client) -> Self {
        Self { client, ..self }
    }

    /// Replaces the verifier that holds trusted HAT keys
    pub fn with_verifier<D>(self, verifier: TokenVerifier<D>) -> HatAppTokenIssuer<O, OC, D> {
        HatAppTokenIssuer {
            client: self.client,
            owner: self.owner,
            owner_id: self.owner_id,
            domain: self.domain,
            verifier,
        }
    }

    /// The provider of owner tokens
    pub fn owner(&self) -> &AuthProvider<O, OC> {
        &self.owner
    }
}

#[async_trait]
impl<O, OC, C> TokenIssuer for HatAppTokenIssuer<O, OC, C>
where
    O: TokenIssuer + 'static,
    OC: Clock + Send + Sync + 'static,
    C: Clock + Send + Sync,
{
    #[tracing::instrument(
        level = "debug",
        skip(self, id),
        fields(application.id = %id, owner.id = %self.owner_id),
    )]
    async fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        let application = ApplicationIdRef::from_str(id.as_str());
        let base_url = self.domain.base_url_for(&self.owner_id)?;
        let issuer = self.domain.issuer_for(&self.owner_id)?;

        let owner_token = self.owner.authorize(&self.owner_id).await?;
        ensure_trusted(&self.client, &base_url, &issuer, &self.verifier).await?;

        tracing::trace!("requesting application token");
        let resp = self
            .client
            .get(format!(
                "{}/api/v2.6/applications/{}/access-token",
                base_url, application
            ))
            .header(TOKEN_HEADER, sensitive(owner_token.value().as_str())?)
            .send()
            .await
            .map_err(AuthError::transport)?;

        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            self.owner.report_invalid(&self.owner_id);
        } else if let Some(rotated) = resp.headers().get(TOKEN_HEADER) {
            if let Ok(rotated) = rotated.to_str() {
                if let Err(error) = self.owner.offer(&self.owner_id, Jwt::from(rotated)) {
                    tracing::debug!(
                        error = (&error as &dyn std::error::Error),
                        "ignoring unverifiable rotated owner token"
                    );
                }
            }
        }

        let value = read_token(resp).await?;
        Ok(self.verifier.decode(value, &issuer)?)
    }

    fn verify(&self, token: &AccessToken) -> bool {
        self.verifier.verify(token)
    }

    fn decode(&self, _id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken> {
        let issuer = self
            .domain
            .issuer_for(&self.owner_id)
            .map_err(InvalidToken::malformed)?;
        self.verifier.decode(value, &issuer)
    }
}

impl<O, OC, C: fmt::Debug> fmt::Debug for HatAppTokenIssuer<O, OC, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HatAppTokenIssuer")
            .field("owner_id", &self.owner_id)
            .field("domain", &self.domain)
            .field("verifier", &self.verifier)
            .finish()
    }
}
