//! Token issuers backed by a HAT's own token endpoints
//!
//! A HAT issues an owner token in exchange for the owner's username and
//! password, and an application token in exchange for an owner token. Both
//! are RS256 JWTs signed with the HAT's key, which the HAT publishes at
//! `/publickey` and names itself by its domain.

use std::{fmt, sync::Arc};

use aliri::{jwt, Jwt};
use aliri_clock::{Clock, System};
use async_trait::async_trait;
use reqwest::header::HeaderValue;

use crate::{
    config::{AuthConfig, HatDomain, TransportMode},
    error::{ConfigError, InvalidToken},
    issuer::TokenIssuer,
    store::{self, CredentialStore},
    AccessToken, AuthError, AuthProvider, CredentialIdRef, TokenVerifier,
};

mod app;
#[cfg(feature = "blocking")]
#[cfg_attr(docsrs, doc(cfg(feature = "blocking")))]
pub mod blocking;
pub mod dto;

pub use app::HatAppTokenIssuer;

pub(crate) use crate::TOKEN_HEADER;

pub(crate) const OWNER_TOKEN_PATH: &str = "/users/access_token";
pub(crate) const PUBLIC_KEY_PATH: &str = "/publickey";

/// Issues owner tokens from the owner's username and password
///
/// The credential id is the HAT username, and the stored secret is the
/// owner's password.
pub struct HatTokenIssuer<S, C = System> {
    client: reqwest::Client,
    store: Arc<S>,
    domain: HatDomain,
    verifier: TokenVerifier<C>,
}

impl<S> HatTokenIssuer<S, System> {
    /// Constructs an issuer with a default HTTP client
    pub fn new(store: S, domain: HatDomain) -> Self {
        Self {
            client: reqwest::Client::new(),
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
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|err| ConfigError::Client(Arc::new(err)))?;

        Ok(Self::new(store, config.domain().clone()).with_client(client))
    }
}

impl<S, C> HatTokenIssuer<S, C> {
    /// Sets the HTTP client used to reach the HAT
    pub fn with_client(self, client: reqwest::Client) -> Self {
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

    /// The credential store consulted on each issuance
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Where HATs are reached
    pub fn domain(&self) -> &HatDomain {
        &self.domain
    }
}

#[async_trait]
impl<S, C> TokenIssuer for HatTokenIssuer<S, C>
where
    S: CredentialStore + 'static,
    C: Clock + Send + Sync,
{
    #[tracing::instrument(level = "debug", skip(self, id), fields(credential.id = %id))]
    async fn issue(&self, id: &CredentialIdRef) -> Result<AccessToken, AuthError> {
        let base_url = self.domain.base_url_for(id)?;
        let issuer = self.domain.issuer_for(id)?;

        let password = store::get_blocking(&self.store, id).await?;
        ensure_trusted(&self.client, &base_url, &issuer, &self.verifier).await?;

        tracing::trace!("requesting owner token");
        let resp = self
            .client
            .get(format!("{}{}", base_url, OWNER_TOKEN_PATH))
            .header("username", sensitive(id.as_str())?)
            .header("password", sensitive(password.as_str())?)
            .send()
            .await
            .map_err(AuthError::transport)?;

        let value = read_token(resp).await?;
        Ok(self.verifier.decode(value, &issuer)?)
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

/// A header value that HTTP tooling will not print
pub(crate) fn sensitive(value: &str) -> Result<HeaderValue, AuthError> {
    let mut value = HeaderValue::from_str(value).map_err(AuthError::transport)?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) async fn read_token(resp: reqwest::Response) -> Result<Jwt, AuthError> {
    let status = resp.status();
    tracing::debug!(
        response.status = status.as_u16(),
        "received token response from HAT"
    );

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(response.status = status.as_u16(), "HAT refused to issue a token");
        return Err(AuthError::IssuanceFailed {
            status: status.as_u16(),
            body,
        });
    }

    let body = resp.bytes().await.map_err(AuthError::transport)?;
    let dto: dto::TokenResponse = serde_json::from_slice(&body).map_err(InvalidToken::malformed)?;
    Ok(dto.access_token)
}

/// Makes sure a key is trusted for `issuer`, fetching it from the HAT if not
#[cfg(feature = "pem")]
pub(crate) async fn ensure_trusted<C>(
    client: &reqwest::Client,
    base_url: &str,
    issuer: &jwt::IssuerRef,
    verifier: &TokenVerifier<C>,
) -> Result<(), AuthError> {
    if verifier.is_trusted(issuer) {
        return Ok(());
    }

    tracing::debug!(%issuer, "fetching HAT public key");
    let resp = client
        .get(format!("{}{}", base_url, PUBLIC_KEY_PATH))
        .send()
        .await
        .map_err(AuthError::transport)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(AuthError::IssuanceFailed {
            status: status.as_u16(),
            body,
        });
    }

    let pem = resp.text().await.map_err(AuthError::transport)?;
    verifier.trust(issuer.to_owned(), parse_public_key(&pem)?);
    Ok(())
}

/// Without PEM support, HAT keys must be trusted up front
#[cfg(not(feature = "pem"))]
pub(crate) async fn ensure_trusted<C>(
    _client: &reqwest::Client,
    _base_url: &str,
    issuer: &jwt::IssuerRef,
    verifier: &TokenVerifier<C>,
) -> Result<(), AuthError> {
    if !verifier.is_trusted(issuer) {
        tracing::warn!(%issuer, "no key trusted for HAT and PEM support is disabled");
    }
    Ok(())
}

#[cfg(feature = "pem")]
pub(crate) fn parse_public_key(pem: &str) -> Result<aliri::Jwk, InvalidToken> {
    let key = aliri::jwa::rsa::PublicKey::from_pem(pem).map_err(InvalidToken::malformed)?;
    Ok(aliri::Jwk::from(key).with_algorithm(aliri::jwa::Algorithm::RS256))
}

/// An authorization provider for HAT owner credentials, using the transport
/// chosen in an [`AuthConfig`]
#[derive(Debug)]
pub enum HatAuth<S> {
    /// Callers await issuance on a `tokio` runtime
    Async(AuthProvider<HatTokenIssuer<S>>),
    /// Callers block on issuance
    #[cfg(feature = "blocking")]
    #[cfg_attr(docsrs, doc(cfg(feature = "blocking")))]
    Blocking(crate::blocking::AuthProvider<blocking::HatTokenIssuer<S>>),
}

impl<S: CredentialStore + 'static> HatAuth<S> {
    /// Builds the provider for the configured transport
    ///
    /// # Errors
    ///
    /// Fails if the configured transport was not compiled in or if the HTTP
    /// client cannot be constructed.
    pub fn from_config(store: S, config: &AuthConfig) -> Result<Self, ConfigError> {
        match config.transport() {
            TransportMode::Async => {
                let issuer = HatTokenIssuer::from_config(store, config)?;
                Ok(Self::Async(AuthProvider::from_config(issuer, config)))
            }
            #[cfg(feature = "blocking")]
            TransportMode::Blocking => {
                let issuer = blocking::HatTokenIssuer::from_config(store, config)?;
                Ok(Self::Blocking(crate::blocking::AuthProvider::from_config(
                    issuer, config,
                )))
            }
            #[cfg(not(feature = "blocking"))]
            mode @ TransportMode::Blocking => Err(ConfigError::UnsupportedTransport(mode)),
        }
    }
}

#[cfg(feature = "keyring")]
#[cfg_attr(docsrs, doc(cfg(feature = "keyring")))]
impl HatAuth<store::KeyringCredentialStore> {
    /// Builds the provider for the configured transport, reading credentials
    /// from the OS keyring under the configured namespace
    ///
    /// # Errors
    ///
    /// As for [`from_config()`][Self::from_config()].
    pub fn with_keyring(config: &AuthConfig) -> Result<Self, ConfigError> {
        Self::from_config(store::KeyringCredentialStore::new(config.namespace()), config)
    }
}

impl<S> HatAuth<S> {
    /// The transport this provider was built for
    pub fn transport(&self) -> TransportMode {
        match self {
            Self::Async(_) => TransportMode::Async,
            #[cfg(feature = "blocking")]
            Self::Blocking(_) => TransportMode::Blocking,
        }
    }

    /// The async provider, if that transport was configured
    pub fn as_async(&self) -> Option<&AuthProvider<HatTokenIssuer<S>>> {
        match self {
            Self::Async(provider) => Some(provider),
            #[cfg(feature = "blocking")]
            Self::Blocking(_) => None,
        }
    }

    /// The blocking provider, if that transport was configured
    #[cfg(feature = "blocking")]
    #[cfg_attr(docsrs, doc(cfg(feature = "blocking")))]
    pub fn as_blocking(&self) -> Option<&crate::blocking::AuthProvider<blocking::HatTokenIssuer<S>>> {
        match self {
            Self::Blocking(provider) => Some(provider),
            Self::Async(_) => None,
        }
    }

    /// Discards the cached token for `id`
    pub fn report_invalid(&self, id: &CredentialIdRef) {
        match self {
            Self::Async(provider) => provider.report_invalid(id),
            #[cfg(feature = "blocking")]
            Self::Blocking(provider) => provider.report_invalid(id),
        }
    }
}
