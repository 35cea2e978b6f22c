//! Middleware to attach HAT access tokens to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to obtain a
//! token from an [`AuthProvider`] for each outbound request and send it in the
//! `x-auth-token` header.
//!
//! If a request already carries the token header by the time the middleware
//! executes, the existing value is left in place and the response is not
//! inspected.
//!
//! The middleware also closes the loop with the provider:
//!
//! * a `401 Unauthorized` or `403 Forbidden` response reports the token as
//!   invalid, so the next request obtains a fresh one;
//! * a response carrying a token header offers that token to the provider,
//!   which keeps it if it outlives the current one.
//!
//! ```
//! use hat_reqwest::AccessTokenMiddleware;
//! use hat_tokens::{hat::HatTokenIssuer, store::InMemoryCredentialStore, AuthProvider, HatDomain};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! let store = InMemoryCredentialStore::new().with_credential("alice", "correct horse");
//! let provider = AuthProvider::new(HatTokenIssuer::new(store, HatDomain::default()));
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(provider, "alice"))
//!     .build();
//!
//! let req = client.get("https://alice.hubat.net/api/v2.6/data/notes/diary");
//! # async move { req
//!     .send()
//!     .await
//!     .unwrap();
//! # };
//! ```
//!
//! The middleware can also be configured to add a token only conditionally,
//! which keeps a HAT token from leaking to other backends sharing the same
//! middleware stack. Predicates can be composed to express more complex
//! requirements.
//!
//! ```
//! use hat_reqwest::{AccessTokenMiddleware, HatHostMatch, HttpsOnly};
//! use hat_tokens::{hat::HatTokenIssuer, store::InMemoryCredentialStore, AuthProvider, HatDomain};
//! use predicates::prelude::PredicateBooleanExt;
//!
//! # let store = InMemoryCredentialStore::new();
//! # let provider = AuthProvider::new(HatTokenIssuer::new(store, HatDomain::default()));
//! AccessTokenMiddleware::new(provider, "alice")
//!     .with_predicate(HttpsOnly.and(HatHostMatch::new(&HatDomain::default(), "alice").unwrap()));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use aliri::Jwt;
use aliri_clock::{Clock, System};
use hat_tokens::{
    error::ConfigError, issuer::TokenIssuer, AuthProvider, CredentialId, CredentialIdRef,
    HatDomain, TOKEN_HEADER,
};
use http::Extensions;
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{HeaderName, HeaderValue},
    Request, Response, StatusCode,
};
use reqwest_middleware::{Error, Middleware, Next, Result};

/// A middleware that injects a HAT access token into outgoing requests
pub struct AccessTokenMiddleware<I, C = System, P = HttpsOnly> {
    provider: AuthProvider<I, C>,
    id: CredentialId,
    header: HeaderName,
    predicate: P,
}

impl<I, C> AccessTokenMiddleware<I, C, HttpsOnly> {
    /// Construct a new middleware sending tokens for the credential `id`
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(provider: AuthProvider<I, C>, id: impl Into<CredentialId>) -> Self {
        Self {
            provider,
            id: id.into(),
            header: HeaderName::from_static(TOKEN_HEADER),
            predicate: HttpsOnly,
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> AccessTokenMiddleware<I, C, P> {
        AccessTokenMiddleware {
            provider: self.provider,
            id: self.id,
            header: self.header,
            predicate,
        }
    }
}

impl<I, C, P> AccessTokenMiddleware<I, C, P> {
    /// Sends the token, and looks for rotated tokens, in `header` instead of
    /// `x-auth-token`
    pub fn with_header(self, header: HeaderName) -> Self {
        Self { header, ..self }
    }

    /// The provider tokens are obtained from
    pub fn provider(&self) -> &AuthProvider<I, C> {
        &self.provider
    }
}

impl<I, C, P> AccessTokenMiddleware<I, C, P>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn header_value(&self) -> Result<HeaderValue> {
        let token = self.provider.authorize(&self.id).await.map_err(Error::middleware)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            let now = System.now();

            tracing::trace!(
                credential.id = %self.id,
                token.lifetime = token.lifetime().0,
                token.issued = token.issued().0,
                token.expiry = token.expiry().0,
                token.until_expired = token.until_expired_at(now).0,
                "obtained access token"
            );
        }

        let mut value = HeaderValue::from_str(token.value().as_str()).map_err(Error::middleware)?;
        value.set_sensitive(true);
        Ok(value)
    }

    fn inspect(&self, resp: &Response) {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(
                credential.id = %self.id,
                response.status = status.as_u16(),
                "HAT rejected access token"
            );
            self.provider.report_invalid(&self.id);
            return;
        }

        let rotated = match resp.headers().get(&self.header).map(HeaderValue::to_str) {
            Some(Ok(rotated)) => rotated,
            Some(Err(_)) => {
                tracing::debug!(credential.id = %self.id, "ignoring rotated token that is not valid UTF-8");
                return;
            }
            None => return,
        };

        match self.provider.offer(&self.id, Jwt::from(rotated)) {
            Ok(true) => tracing::debug!(credential.id = %self.id, "adopted rotated token"),
            Ok(false) => {}
            Err(error) => tracing::debug!(
                credential.id = %self.id,
                %error,
                "ignoring unverifiable rotated token"
            ),
        }
    }
}

#[async_trait::async_trait]
impl<I, C, P> Middleware for AccessTokenMiddleware<I, C, P>
where
    I: TokenIssuer + 'static,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let attach = self.predicate.eval(&req) && !req.headers().contains_key(&self.header);
        if attach {
            let value = self.header_value().await?;
            req.headers_mut().insert(self.header.clone(), value);
        }

        let resp = next.run(req, extensions).await?;

        if attach {
            self.inspect(&resp);
        }

        Ok(resp)
    }
}

impl<I, C, P: fmt::Debug> fmt::Debug for AccessTokenMiddleware<I, C, P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("predicate", &self.predicate)
            .finish()
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "scheme",
                req.url().scheme().to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "host",
                req.url().host_str().unwrap_or("<none>").to_owned(),
            ))
        })
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host == {}", self.host)
    }
}

/// Only attach an access token if the request is addressed to the HAT that
/// issued it
///
/// The request's `host[:port]` must equal the authority the HAT names
/// itself by, so a fixed base URL with a port matches only that port.
#[derive(Clone, Debug)]
pub struct HatHostMatch {
    authority: String,
}

impl HatHostMatch {
    /// Construct a predicate matching the HAT of credential `id` under `domain`
    ///
    /// # Errors
    ///
    /// Fails if `domain` holds a base URL that is not absolute.
    pub fn new(
        domain: &HatDomain,
        id: impl AsRef<str>,
    ) -> std::result::Result<Self, ConfigError> {
        let issuer = domain.issuer_for(CredentialIdRef::from_str(id.as_ref()))?;
        Ok(Self {
            authority: issuer.as_str().to_owned(),
        })
    }

    fn authority_of(req: &Request) -> Option<String> {
        let host = req.url().host_str()?;
        Some(match req.url().port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_owned(),
        })
    }
}

impl Predicate<Request> for HatHostMatch {
    fn eval(&self, req: &Request) -> bool {
        Self::authority_of(req).as_deref() == Some(self.authority.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        (result != expected).then(|| {
            reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                "authority",
                Self::authority_of(req).unwrap_or_else(|| "<none>".to_owned()),
            ))
        })
    }
}

impl reflection::PredicateReflection for HatHostMatch {}
impl fmt::Display for HatHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "authority == {}", self.authority)
    }
}
