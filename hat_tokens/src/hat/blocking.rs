//! Owner-token issuance over a blocking HTTP client

use std::{fmt, sync::Arc};

use aliri::{jwt, Jwt};
use aliri_clock::{Clock, System};

use super::{dto, sensitive, OWNER_TOKEN_PATH};
use crate::{
    blocking::BlockingTokenIssuer,
    config::{AuthConfig, HatDomain},
    error::{ConfigError, InvalidToken},
    store::CredentialStore,
    AccessToken, AuthError, CredentialIdRef, TokenVerifier,
};

/// Issues owner tokens from the owner's username and password, blocking the
/// calling thread
///
/// Must not be used from within an async runtime.
pub struct HatTokenIssuer<S, C = System> {
    client: reqwest::blocking::Client,
    store: Arc<S>,
    domain: HatDomain,
    verifier: TokenVerifier<C>,
}

impl<S> HatTokenIssuer<S, System> {
    /// Constructs an issuer with a default HTTP client
    pub fn new(store: S, domain: HatDomain) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            store: Arc::new(store),
            domain,
            verifier: TokenVerifier::new(),
        }
    }

    /// Constructs an issuer whose HTTP client applies the configured
    /// request timeout
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn from_config(store: S, config: &AuthConfig) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|err| ConfigError::Client(Arc::new(err)))?;

        Ok(Self::new(store, config.domain().clone()).with_client(client))
    }
}

impl<S, C> HatTokenIssuer<S, C> {
    /// Sets the HTTP client used to reach the HAT
    pub fn with_client(self, client: reqwest::blocking::Client) -> Self {
        Self { client, ..self }
    }

    /// Replaces the verifier that holds trusted HAT keys
    pub fn with_verifier<D>(self, verifier: TokenVerifier<D>) -> HatTokenIssuer<S, D> {
        HatTokenIssuer {
            client: self.client,
            store: self.store,
            domain: self.domain,
            verifier,
        }
    }

    /// The verifier holding trusted HAT keys
    pub fn verifier(&self) -> &TokenVerifier<C> {
        &self.verifier
    }
}

impl<S: CredentialStore, C: Clock + Send + Sync> HatTokenIssuer<S, C> {
    #[cfg(feature = "pem")]
    fn ensure_trusted(&self, base_url: &str, issuer: &jwt::IssuerRef) -> Result<(), AuthError> {
        if self.verifier.is_trusted(issuer) {
            return Ok(());
        }

        tracing::debug!(%issuer, "fetching HAT public key");
        let resp = self
            .client
            .get(format!("{}{}", base_url, super::PUBLIC_KEY_PATH))
            .send()
            .map_err(AuthError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::IssuanceFailed {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }

        let pem = resp.text().map_err(AuthError::transport)?;
        self.verifier
            .trust(issuer.to_owned(), super::parse_public_key(&pem)?);
        Ok(())
    }

    #[cfg(not(feature = "pem"))]
    fn ensure_trusted(&self, _base_url: &str, issuer: &jwt::IssuerRef) -> Result<(), AuthError> {
        if !self.verifier.is_trusted(issuer) {
            tracing::warn!(%issuer, "no key trusted for HAT and PEM support is disabled");
        }
        Ok(())
    }
}

impl<S, C> BlockingTokenIssuer for HatTokenIssuer<S, C>
where
    S: CredentialStore,
    C: Clock + Send + Sync,
{
    #[tracing::instrument(level = "debug", skip(self, id), fields(credential.id = %id))]
    fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        let base_url = self.domain.base_url_for(id)?;
        let issuer = self.domain.issuer_for(id)?;

        let password = self.store.get(id)?;
        self.ensure_trusted(&base_url, &issuer)?;

        tracing::trace!("requesting owner token");
        let resp = self
            .client
            .get(format!("{}{}", base_url, OWNER_TOKEN_PATH))
            .header("username", sensitive(id.as_str())?)
            .header("password", sensitive(password.as_str())?)
            .send()
            .map_err(AuthError::transport)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from HAT"
        );

        if !status.is_success() {
            tracing::warn!(response.status = status.as_u16(), "HAT refused to issue a token");
            return Err(AuthError::IssuanceFailed {
                status: status.as_u16(),
                body: resp.text().unwrap_or_default(),
            });
        }

        let body = resp.bytes().map_err(AuthError::transport)?;
        let dto: dto::TokenResponse =
            serde_json::from_slice(&body).map_err(InvalidToken::malformed)?;
        Ok(self.verifier.decode(dto.access_token, &issuer)?)
    }

    fn verify(&self, token: &AccessToken) -> bool {
        self.verifier.verify(token)
    }

    fn decode(&self, id: &CredentialIdRef, value: Jwt) -> Result<AccessToken, InvalidToken> {
        let issuer = self
            .domain
            .issuer_for(id)
            .map_err(InvalidToken::malformed)?;
        self.verifier.decode(value, &issuer)
    }
}

impl<S, C: fmt::Debug> fmt::Debug for HatTokenIssuer<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HatTokenIssuer")
            .field("domain", &self.domain)
            .field("verifier", &self.verifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        blocking::AuthProvider,
        hat::tests::{claims_from, fixed, id, trusting_verifier},
        store::InMemoryCredentialStore,
        test_util::mint,
    };

    /// Returns a constructor to run on a thread outside the async runtime
    fn issuer_for(server: &MockServer) -> impl FnOnce() -> HatTokenIssuer<InMemoryCredentialStore> {
        let domain = fixed(server);
        let verifier = trusting_verifier(server);
        move || {
            let store = InMemoryCredentialStore::new().with_credential("alice", "s3cr3t");
            HatTokenIssuer::new(store, domain).with_verifier(verifier)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_provider_issues_once() -> Result<()> {
        let server = MockServer::start().await;
        let value = mint(&claims_from(&server, "alice"));
        Mock::given(method("GET"))
            .and(path(OWNER_TOKEN_PATH))
            .and(header("username", "alice"))
            .and(header("password", "s3cr3t"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "accessToken": value.as_str() })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let build = issuer_for(&server);
        let subject = tokio::task::spawn_blocking(move || -> Result<String> {
            let provider = AuthProvider::new(build());
            provider.authorize(id())?;
            let token = provider.authorize(id())?;
            Ok(token.subject().map(|s| s.as_str().to_owned()).unwrap_or_default())
        })
        .await??;

        assert_eq!(subject, "alice");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refusal_carries_status() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(OWNER_TOKEN_PATH))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let build = issuer_for(&server);
        let result = tokio::task::spawn_blocking(move || build().issue(id())).await?;

        assert!(matches!(result, Err(AuthError::IssuanceFailed { status: 403, .. })));
        Ok(())
    }
}
