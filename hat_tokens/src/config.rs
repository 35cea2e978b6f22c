//! Configuration for authorizing against a HAT

use aliri::jwt;
use aliri_clock::DurationSecs;
use serde::{Deserialize, Serialize};

use crate::{cache::DEFAULT_SKEW, error::ConfigError, store::DEFAULT_NAMESPACE, CredentialIdRef};

/// The domain suffix under which hosted HATs are addressed
pub const DEFAULT_DOMAIN_SUFFIX: &str = "hubat.net";

const DEFAULT_REQUEST_TIMEOUT: DurationSecs = DurationSecs(30);

/// How callers wait on token issuance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Issue tokens on a `tokio` runtime
    #[default]
    Async,
    /// Issue tokens on the calling thread
    Blocking,
}

/// Where the HAT belonging to a credential can be reached
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HatDomain {
    /// Each HAT is served from `https://{username}.{suffix}`
    Subdomain {
        /// The domain suffix, such as `hubat.net`
        suffix: String,
    },
    /// Every credential addresses the same HAT
    ///
    /// Useful for self-hosted HATs and for tests.
    Fixed {
        /// An absolute `http` or `https` URL, without a trailing path
        base_url: String,
    },
}

impl Default for HatDomain {
    fn default() -> Self {
        Self::Subdomain {
            suffix: DEFAULT_DOMAIN_SUFFIX.to_owned(),
        }
    }
}

impl HatDomain {
    /// The base URL of the HAT for `id`, without a trailing slash
    ///
    /// # Errors
    ///
    /// Fails if a fixed base URL is not an absolute `http` or `https` URL, or
    /// if `id` cannot name a subdomain.
    pub fn base_url_for(&self, id: &CredentialIdRef) -> Result<String, ConfigError> {
        match self {
            Self::Subdomain { suffix } => Ok(format!("https://{}.{}", dns_label(id)?, suffix)),
            Self::Fixed { base_url } => {
                authority(base_url)?;
                Ok(base_url.trim_end_matches('/').to_owned())
            }
        }
    }

    /// The issuer expected on tokens from the HAT for `id`
    ///
    /// HATs name themselves by their domain authority (`host[:port]`).
    ///
    /// # Errors
    ///
    /// As for [`base_url_for()`][Self::base_url_for()].
    pub fn issuer_for(&self, id: &CredentialIdRef) -> Result<jwt::Issuer, ConfigError> {
        match self {
            Self::Subdomain { suffix } => {
                Ok(jwt::Issuer::from(format!("{}.{}", dns_label(id)?, suffix)))
            }
            Self::Fixed { base_url } => Ok(jwt::Issuer::from(authority(base_url)?.to_owned())),
        }
    }
}

/// A subdomain label: 1 to 63 ASCII alphanumerics or `-`, not starting or
/// ending with `-`
fn dns_label(id: &CredentialIdRef) -> Result<&str, ConfigError> {
    let label = id.as_str();
    let valid = (1..=63).contains(&label.len())
        && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        && !label.starts_with('-')
        && !label.ends_with('-');

    if valid {
        Ok(label)
    } else {
        Err(ConfigError::InvalidCredentialId(id.to_owned()))
    }
}

fn authority(url: &str) -> Result<&str, ConfigError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ConfigError::InvalidBaseUrl(url.to_owned()))?;

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(ConfigError::InvalidBaseUrl(url.to_owned()));
    }

    Ok(authority)
}

/// Settings shared by the authorization components
///
/// Every field has a default, so an empty document deserializes into
/// [`AuthConfig::default()`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "skew")]
    skew_secs: u64,
    cache_enabled: bool,
    transport: TransportMode,
    namespace: String,
    domain: HatDomain,
    #[serde(rename = "request_timeout")]
    request_timeout_secs: u64,
}

impl Default for AuthConfig {
    /// Default configuration
    ///
    /// Uses a 30 second skew, caching enabled, async transport, the `hat-sdk`
    /// keyring namespace, HATs under `hubat.net`, and a 30 second request
    /// timeout.
    fn default() -> Self {
        Self {
            skew_secs: DEFAULT_SKEW.0,
            cache_enabled: true,
            transport: TransportMode::Async,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            domain: HatDomain::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.0,
        }
    }
}

impl AuthConfig {
    /// Constructs the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the safety margin subtracted from each token's expiry
    pub fn with_skew(self, skew: DurationSecs) -> Self {
        Self {
            skew_secs: skew.0,
            ..self
        }
    }

    /// Enables or disables token reuse
    pub fn with_cache_enabled(self, cache_enabled: bool) -> Self {
        Self {
            cache_enabled,
            ..self
        }
    }

    /// Sets how callers wait on issuance
    pub fn with_transport(self, transport: TransportMode) -> Self {
        Self { transport, ..self }
    }

    /// Sets the service name under which OS keyring entries are stored
    pub fn with_namespace(self, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..self
        }
    }

    /// Sets where HATs are reached
    pub fn with_domain(self, domain: HatDomain) -> Self {
        Self { domain, ..self }
    }

    /// Sets the timeout applied to each request to a HAT
    pub fn with_request_timeout(self, timeout: DurationSecs) -> Self {
        Self {
            request_timeout_secs: timeout.0,
            ..self
        }
    }

    /// The safety margin subtracted from each token's expiry
    pub fn skew(&self) -> DurationSecs {
        DurationSecs(self.skew_secs)
    }

    pub(crate) fn skew_secs(&self) -> u64 {
        self.skew_secs
    }

    /// Whether tokens are reused until they near expiry
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    /// How callers wait on issuance
    pub fn transport(&self) -> TransportMode {
        self.transport
    }

    /// The service name under which OS keyring entries are stored
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Where HATs are reached
    pub fn domain(&self) -> &HatDomain {
        &self.domain
    }

    /// The timeout applied to each request to a HAT
    pub fn request_timeout(&self) -> DurationSecs {
        DurationSecs(self.request_timeout_secs)
    }

    /// The request timeout as a standard duration
    pub fn request_timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    fn id() -> &'static CredentialIdRef {
        CredentialIdRef::from_str("alice")
    }

    #[test]
    fn empty_document_yields_defaults() -> Result<()> {
        let config: AuthConfig = serde_json::from_str("{}")?;

        assert_eq!(config, AuthConfig::default());
        assert_eq!(config.skew(), DurationSecs(30));
        assert!(config.cache_enabled());
        assert_eq!(config.transport(), TransportMode::Async);
        assert_eq!(config.namespace(), "hat-sdk");
        assert_eq!(config.request_timeout(), DurationSecs(30));
        Ok(())
    }

    #[test]
    fn partial_document_overrides_only_named_fields() -> Result<()> {
        let config: AuthConfig = serde_json::from_str(
            r#"{
                "skew": 5,
                "transport": "blocking",
                "domain": { "fixed": { "base_url": "http://127.0.0.1:9000" } }
            }"#,
        )?;

        assert_eq!(config.skew(), DurationSecs(5));
        assert_eq!(config.transport(), TransportMode::Blocking);
        assert!(config.cache_enabled());
        assert_eq!(
            config.domain(),
            &HatDomain::Fixed {
                base_url: "http://127.0.0.1:9000".into()
            }
        );
        Ok(())
    }

    #[test]
    fn builders_set_fields() {
        let config = AuthConfig::new()
            .with_skew(DurationSecs(0))
            .with_cache_enabled(false)
            .with_namespace("my-app")
            .with_request_timeout(DurationSecs(5));

        assert_eq!(config.skew(), DurationSecs(0));
        assert!(!config.cache_enabled());
        assert_eq!(config.namespace(), "my-app");
        assert_eq!(config.request_timeout_duration(), std::time::Duration::from_secs(5));
    }

    mod hat_domain {
        use super::*;

        #[test]
        fn subdomain_addresses_each_hat_by_username() -> Result<()> {
            let domain = HatDomain::default();

            assert_eq!(domain.base_url_for(id())?, "https://alice.hubat.net");
            assert_eq!(domain.issuer_for(id())?.as_str(), "alice.hubat.net");
            Ok(())
        }

        #[test]
        fn subdomain_rejects_ids_that_would_change_the_host() {
            let domain = HatDomain::default();

            let ids = [
                "evil.example/steal?",
                "a@evil.example",
                "a:8080",
                "a#frag",
                "",
                "-alice",
                "alice-",
            ];

            for bad in ids {
                let id = CredentialIdRef::from_str(bad);
                assert!(
                    matches!(domain.base_url_for(id), Err(ConfigError::InvalidCredentialId(_))),
                    "{:?} should be rejected",
                    bad
                );
                assert!(domain.issuer_for(id).is_err());
            }
        }

        #[test]
        fn subdomain_accepts_hyphenated_and_numeric_labels() -> Result<()> {
            let id = CredentialIdRef::from_str("hat-owner-1");

            assert_eq!(
                HatDomain::default().base_url_for(id)?,
                "https://hat-owner-1.hubat.net"
            );
            assert!(HatDomain::default()
                .base_url_for(CredentialIdRef::from_str(&"a".repeat(64)))
                .is_err());
            Ok(())
        }

        #[test]
        fn fixed_url_issuer_is_its_authority() -> Result<()> {
            let domain = HatDomain::Fixed {
                base_url: "http://127.0.0.1:9000/".into(),
            };

            assert_eq!(domain.base_url_for(id())?, "http://127.0.0.1:9000");
            assert_eq!(domain.issuer_for(id())?.as_str(), "127.0.0.1:9000");
            Ok(())
        }

        #[test]
        fn rejects_relative_base_url() {
            let domain = HatDomain::Fixed {
                base_url: "hat.example.com".into(),
            };

            assert!(matches!(
                domain.base_url_for(id()),
                Err(ConfigError::InvalidBaseUrl(_))
            ));
            assert!(domain.issuer_for(id()).is_err());
        }

        #[test]
        fn rejects_url_without_host() {
            let domain = HatDomain::Fixed {
                base_url: "https:///users".into(),
            };

            assert!(domain.issuer_for(id()).is_err());
        }
    }
}
