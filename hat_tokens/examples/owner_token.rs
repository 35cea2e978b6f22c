use std::time::Duration;

use clap::Parser;
use hat_tokens::{
    hat::HatTokenIssuer,
    store::{CredentialStore, KeyringCredentialStore},
    AuthConfig, AuthProvider, CredentialId, HatDomain, Secret, TokenStatus,
};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The HAT username, which also names the HAT's domain
    #[arg(short, long, env = "HAT_USERNAME")]
    username: CredentialId,

    /// Stores this password in the OS keyring before starting
    #[arg(short, long, env = "HAT_PASSWORD", hide_env_values = true)]
    password: Option<Secret>,

    /// The keyring service name under which the password is stored
    #[arg(short, long, env = "HAT_NAMESPACE", default_value = "hat-sdk")]
    namespace: String,

    /// A fixed base URL for a self-hosted HAT
    #[arg(short, long, env = "HAT_BASE_URL")]
    base_url: Option<String>,

    /// Seconds between authorization attempts
    #[arg(short, long, default_value_t = 5)]
    interval: u64,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let mut config = AuthConfig::default().with_namespace(opts.namespace);
    if let Some(base_url) = opts.base_url {
        config = config.with_domain(HatDomain::Fixed { base_url });
    }

    let store = KeyringCredentialStore::new(config.namespace());
    if let Some(password) = &opts.password {
        store.put(&opts.username, password)?;
        tracing::info!(username = %opts.username, "stored password in keyring");
    }

    let issuer = HatTokenIssuer::from_config(store, &config)?;
    let provider = AuthProvider::from_config(issuer, &config);

    let mut interval = time::interval(Duration::from_secs(opts.interval));
    loop {
        interval.tick().await;

        let token = match provider.authorize(&opts.username).await {
            Ok(token) => token,
            Err(error) if error.is_retryable() => {
                tracing::warn!(error = (&error as &dyn std::error::Error), "unable to authorize, will retry");
                continue;
            }
            Err(error) => return Err(error.into()),
        };

        let status = token.token_status(config.skew());
        match status {
            TokenStatus::Valid => {
                tracing::debug!(?status, expiry = token.expiry().0, "pulled token")
            }
            TokenStatus::Expiring => {
                tracing::warn!(?status, expiry = token.expiry().0, "pulled token")
            }
            TokenStatus::Expired => {
                tracing::error!(?status, expiry = token.expiry().0, "pulled token")
            }
        }
    }
}
