#![forbid(unsafe_code)]

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = codedrop_app::AppConfig::from_env().inspect_err(|error| {
        tracing::error!(error = %error, "invalid configuration");
    })?;
    codedrop_app::run(config).await
}
