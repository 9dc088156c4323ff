#![forbid(unsafe_code)]

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use codedrop_api::ratelimit::{DEFAULT_MAX_REQUESTS, DEFAULT_SWEEP_INTERVAL, DEFAULT_WINDOW};
use codedrop_api::{
    ApiState, FixedWindowLimiter, RateLimitConfig, UploadLimits, DEFAULT_FILE_LIFETIME_DAYS,
    DEFAULT_MAX_FILE_SIZE,
};
use codedrop_auth::jwt::{normalize_issuer, JwtVerifier, JwtVerifierConfig};
use codedrop_auth::opaque::DEFAULT_CACHE_TTL;
use codedrop_auth::resolver::DEFAULT_STRATEGY_TIMEOUT;
use codedrop_auth::{
    CredentialResolver, OpaqueTokenResolver, OpaqueTokenResolverConfig, ResolutionStrategy,
};
use codedrop_realtime::broker::ConnectionRegistry;
use codedrop_realtime::{RealtimeRuntime, DEFAULT_HOUSEKEEPING_INTERVAL};
use codedrop_storage::reaper::DEFAULT_REAPER_INTERVAL;
use codedrop_storage::{migrate_with_pool, ExpiryReaper, ObjectStoreBlobStore, PostgresStorage};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::ObjectStore;
use tokio::sync::watch;
use url::Url;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_STORAGE_ROOT: &str = "/data/uploads";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub auth: AuthConfig,
    pub file_storage: FileStorageConfig,
    pub limits: LimitsConfig,
}

/// Trusted identity provider: signed credentials first, then the userinfo lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub issuer: String,
    pub jwks_url: String,
    pub audiences: Vec<String>,
    pub userinfo_url: String,
    pub strategy_timeout: Duration,
    pub opaque_cache_ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStorageConfig {
    Local {
        path: PathBuf,
    },
    S3(S3Settings),
}

/// An S3-compatible bucket addressed by path (`<endpoint>/<bucket>/<key>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// Absolute `http(s)` URL; a bare `host:port` is completed from `FILE_S3_USE_SSL`.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

impl S3Settings {
    const DEFAULT_REGION: &'static str = "us-east-1";

    fn from_env(env: FileStorageEnv) -> anyhow::Result<Self> {
        let mut missing = Vec::new();
        let mut take = |value: Option<String>, name: &'static str| {
            let value = value
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty());
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };
        let endpoint = take(env.s3_endpoint, "FILE_S3_ENDPOINT");
        let access_key = take(env.s3_access_key, "FILE_S3_ACCESS_KEY");
        let secret_key = take(env.s3_secret_key, "FILE_S3_SECRET_KEY");
        let bucket = take(env.s3_bucket, "FILE_S3_BUCKET");
        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "FILE_STORAGE_BACKEND=s3 also needs {}",
                missing.join(", ")
            ));
        }

        let use_ssl = parse_flag(env.s3_use_ssl, "FILE_S3_USE_SSL", true)?;
        let endpoint = if endpoint.contains("://") {
            endpoint
        } else if use_ssl {
            format!("https://{endpoint}")
        } else {
            format!("http://{endpoint}")
        };
        validate_http_url(&endpoint, "FILE_S3_ENDPOINT")?;

        Ok(Self {
            endpoint,
            access_key,
            secret_key,
            bucket,
            region: env
                .s3_region
                .filter(|region| !region.trim().is_empty())
                .unwrap_or_else(|| Self::DEFAULT_REGION.to_owned()),
        })
    }

    fn object_store(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&self.endpoint)
            .with_allow_http(self.endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .with_region(&self.region)
            .with_bucket_name(&self.bucket)
            .with_access_key_id(&self.access_key)
            .with_secret_access_key(&self.secret_key)
            .build()
            .map_err(|error| anyhow::anyhow!("cannot use bucket {:?}: {error}", self.bucket))?;
        Ok(Arc::new(store))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitsConfig {
    pub max_file_size: usize,
    pub file_lifetime_days: i64,
    pub rate_limit: RateLimitConfig,
    pub rate_limit_sweep_interval: Duration,
    pub reaper_interval: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            file_lifetime_days: DEFAULT_FILE_LIFETIME_DAYS,
            rate_limit: RateLimitConfig::default(),
            rate_limit_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AuthEnv {
    issuer: Option<String>,
    jwks_url: Option<String>,
    audience: Option<String>,
    userinfo_url: Option<String>,
    timeout_ms: Option<String>,
    cache_ttl_secs: Option<String>,
}

impl AuthEnv {
    fn from_env() -> Self {
        Self {
            issuer: std::env::var("OIDC_ISSUER").ok(),
            jwks_url: std::env::var("OIDC_JWKS_URI").ok(),
            audience: std::env::var("OIDC_AUDIENCE")
                .ok()
                .or_else(|| std::env::var("OIDC_CLIENT_ID").ok()),
            userinfo_url: std::env::var("OIDC_USERINFO_URI").ok(),
            timeout_ms: std::env::var("AUTH_TIMEOUT_MS").ok(),
            cache_ttl_secs: std::env::var("OPAQUE_TOKEN_CACHE_TTL_SECS").ok(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FileStorageEnv {
    backend: Option<String>,
    path: Option<String>,
    s3_endpoint: Option<String>,
    s3_access_key: Option<String>,
    s3_secret_key: Option<String>,
    s3_bucket: Option<String>,
    s3_region: Option<String>,
    s3_use_ssl: Option<String>,
}

impl FileStorageEnv {
    fn from_env() -> Self {
        Self {
            backend: std::env::var("FILE_STORAGE_BACKEND").ok(),
            path: std::env::var("STORAGE_ROOT").ok(),
            s3_endpoint: std::env::var("FILE_S3_ENDPOINT").ok(),
            s3_access_key: std::env::var("FILE_S3_ACCESS_KEY").ok(),
            s3_secret_key: std::env::var("FILE_S3_SECRET_KEY").ok(),
            s3_bucket: std::env::var("FILE_S3_BUCKET").ok(),
            s3_region: std::env::var("FILE_S3_REGION").ok(),
            s3_use_ssl: std::env::var("FILE_S3_USE_SSL").ok(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LimitsEnv {
    max_file_size: Option<String>,
    file_expiry_days: Option<String>,
    rate_limit_window_secs: Option<String>,
    rate_limit_max_requests: Option<String>,
    rate_limit_sweep_secs: Option<String>,
    reaper_interval_secs: Option<String>,
}

impl LimitsEnv {
    fn from_env() -> Self {
        Self {
            max_file_size: std::env::var("MAX_FILE_SIZE").ok(),
            file_expiry_days: std::env::var("FILE_EXPIRY_DAYS").ok(),
            rate_limit_window_secs: std::env::var("RATE_LIMIT_WINDOW_SECS").ok(),
            rate_limit_max_requests: std::env::var("RATE_LIMIT_MAX_REQUESTS").ok(),
            rate_limit_sweep_secs: std::env::var("RATE_LIMIT_SWEEP_SECS").ok(),
            reaper_interval_secs: std::env::var("REAPER_INTERVAL_SECS").ok(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::from_values(
            std::env::var("LISTEN_ADDR").ok(),
            std::env::var("DATABASE_URL").ok(),
            AuthEnv::from_env(),
        )?;
        config.file_storage = parse_file_storage(FileStorageEnv::from_env())?;
        config.limits = parse_limits(LimitsEnv::from_env())?;
        Ok(config)
    }

    fn from_values(
        listen_addr: Option<String>,
        database_url: Option<String>,
        auth: AuthEnv,
    ) -> anyhow::Result<Self> {
        let listen_addr = listen_addr.unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_owned());
        let listen_addr = SocketAddr::from_str(&listen_addr)
            .map_err(|error| anyhow::anyhow!("invalid LISTEN_ADDR {listen_addr:?}: {error}"))?;
        let database_url = database_url
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;

        Ok(Self {
            listen_addr,
            database_url,
            auth: parse_auth(auth)?,
            file_storage: FileStorageConfig::Local {
                path: PathBuf::from(DEFAULT_STORAGE_ROOT),
            },
            limits: LimitsConfig::default(),
        })
    }
}

/// Connects storage, wires the credential chain and background tasks, then
/// serves until ctrl-c.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let storage = Arc::new(PostgresStorage::connect(&config.database_url).await?);
    migrate_with_pool(storage.pool()).await?;

    let blobs = Arc::new(ObjectStoreBlobStore::new(build_file_object_store(
        &config.file_storage,
    )?));
    let validator = Arc::new(build_credential_resolver(&config.auth));
    let registry = Arc::new(ConnectionRegistry::default());
    let limiter = Arc::new(FixedWindowLimiter::new(config.limits.rate_limit));
    let upload_limits = UploadLimits {
        max_file_size: config.limits.max_file_size,
        file_lifetime: chrono::Duration::days(config.limits.file_lifetime_days),
    };

    let api_state = ApiState::new(storage.clone(), blobs.clone(), validator)
        .with_registry(Arc::clone(&registry))
        .with_rate_limiter(Arc::clone(&limiter))
        .with_upload_limits(upload_limits);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Arc::new(ExpiryReaper::new(storage, blobs)).spawn(
        config.limits.reaper_interval,
        shutdown_rx.clone(),
    );
    let sweeper = limiter.spawn_sweeper(config.limits.rate_limit_sweep_interval, shutdown_rx.clone());
    let housekeeping =
        RealtimeRuntime::spawn_housekeeping(registry, DEFAULT_HOUSEKEEPING_INTERVAL, shutdown_rx);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        issuer = %config.auth.issuer,
        max_file_size = config.limits.max_file_size,
        "server listening"
    );
    let served = axum::serve(
        listener,
        codedrop_api::router(api_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    })
    .await;

    let _ = shutdown_tx.send(true);
    for task in [reaper, sweeper, housekeeping] {
        if let Err(error) = task.await {
            tracing::warn!(error = %error, "background task ended abnormally");
        }
    }
    served?;
    Ok(())
}

fn build_credential_resolver(config: &AuthConfig) -> CredentialResolver {
    let jwt = JwtVerifier::new(JwtVerifierConfig {
        issuer: config.issuer.clone(),
        jwks_url: config.jwks_url.clone(),
        audiences: config.audiences.clone(),
        refresh_ttl: Duration::ZERO,
    });
    let opaque = OpaqueTokenResolver::new(OpaqueTokenResolverConfig {
        cache_ttl: config.opaque_cache_ttl,
        request_timeout: config.strategy_timeout,
        ..OpaqueTokenResolverConfig::new(config.userinfo_url.clone())
    });
    let strategies: Vec<Arc<dyn ResolutionStrategy>> = vec![Arc::new(jwt), Arc::new(opaque)];
    CredentialResolver::new(strategies).with_timeout(config.strategy_timeout)
}

fn build_file_object_store(config: &FileStorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match config {
        FileStorageConfig::Local { path } => {
            std::fs::create_dir_all(path)?;
            let storage = LocalFileSystem::new_with_prefix(path)?;
            Ok(Arc::new(storage))
        }
        FileStorageConfig::S3(settings) => settings.object_store(),
    }
}

fn parse_auth(env: AuthEnv) -> anyhow::Result<AuthConfig> {
    let issuer = env
        .issuer
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("OIDC_ISSUER must be set"))?;
    validate_http_url(issuer.trim(), "OIDC_ISSUER")?;
    let issuer = normalize_issuer(issuer.trim());

    let jwks_url = match env.jwks_url.filter(|value| !value.trim().is_empty()) {
        Some(url) => {
            validate_http_url(&url, "OIDC_JWKS_URI")?;
            url
        }
        None => format!("{issuer}/.well-known/jwks.json"),
    };
    let userinfo_url = match env.userinfo_url.filter(|value| !value.trim().is_empty()) {
        Some(url) => {
            validate_http_url(&url, "OIDC_USERINFO_URI")?;
            url
        }
        None => format!("{issuer}/userinfo"),
    };
    let audiences = parse_audiences(env.audience);
    let timeout_ms = parse_number(
        env.timeout_ms,
        "AUTH_TIMEOUT_MS",
        u64::try_from(DEFAULT_STRATEGY_TIMEOUT.as_millis()).unwrap_or(5_000),
    )?;
    let cache_ttl_secs = parse_number(
        env.cache_ttl_secs,
        "OPAQUE_TOKEN_CACHE_TTL_SECS",
        DEFAULT_CACHE_TTL.as_secs(),
    )?;

    Ok(AuthConfig {
        issuer,
        jwks_url,
        audiences,
        userinfo_url,
        strategy_timeout: Duration::from_millis(positive(timeout_ms, "AUTH_TIMEOUT_MS")?),
        opaque_cache_ttl: Duration::from_secs(cache_ttl_secs),
    })
}

fn parse_audiences(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_file_storage(env: FileStorageEnv) -> anyhow::Result<FileStorageConfig> {
    let backend = env.backend.clone().unwrap_or_else(|| "local".to_owned());
    match backend.as_str() {
        "local" | "fs" => Ok(FileStorageConfig::Local {
            path: PathBuf::from(env.path.unwrap_or_else(|| DEFAULT_STORAGE_ROOT.to_owned())),
        }),
        "s3" => S3Settings::from_env(env).map(FileStorageConfig::S3),
        _ => Err(anyhow::anyhow!(
            "invalid FILE_STORAGE_BACKEND {:?}: expected \"local\" or \"s3\"",
            backend
        )),
    }
}

fn parse_limits(env: LimitsEnv) -> anyhow::Result<LimitsConfig> {
    let max_file_size = parse_number(env.max_file_size, "MAX_FILE_SIZE", DEFAULT_MAX_FILE_SIZE)?;
    let file_lifetime_days = parse_number(
        env.file_expiry_days,
        "FILE_EXPIRY_DAYS",
        DEFAULT_FILE_LIFETIME_DAYS,
    )?;
    if file_lifetime_days <= 0 || chrono::Duration::try_days(file_lifetime_days).is_none() {
        return Err(anyhow::anyhow!(
            "invalid FILE_EXPIRY_DAYS {file_lifetime_days}: must be a positive number of days"
        ));
    }
    let window_secs = parse_number(
        env.rate_limit_window_secs,
        "RATE_LIMIT_WINDOW_SECS",
        DEFAULT_WINDOW.as_secs(),
    )?;
    let max_requests = parse_number(
        env.rate_limit_max_requests,
        "RATE_LIMIT_MAX_REQUESTS",
        DEFAULT_MAX_REQUESTS,
    )?;
    let sweep_secs = parse_number(
        env.rate_limit_sweep_secs,
        "RATE_LIMIT_SWEEP_SECS",
        DEFAULT_SWEEP_INTERVAL.as_secs(),
    )?;
    let reaper_secs = parse_number(
        env.reaper_interval_secs,
        "REAPER_INTERVAL_SECS",
        DEFAULT_REAPER_INTERVAL.as_secs(),
    )?;

    Ok(LimitsConfig {
        max_file_size: positive(max_file_size, "MAX_FILE_SIZE")?,
        file_lifetime_days,
        rate_limit: RateLimitConfig {
            window: Duration::from_secs(positive(window_secs, "RATE_LIMIT_WINDOW_SECS")?),
            max_requests: positive(max_requests, "RATE_LIMIT_MAX_REQUESTS")?,
        },
        rate_limit_sweep_interval: Duration::from_secs(positive(
            sweep_secs,
            "RATE_LIMIT_SWEEP_SECS",
        )?),
        reaper_interval: Duration::from_secs(positive(reaper_secs, "REAPER_INTERVAL_SECS")?),
    })
}

fn parse_number<T>(value: Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match value.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid {name} {raw:?}: {error}")),
    }
}

fn positive<T>(value: T, name: &str) -> anyhow::Result<T>
where
    T: PartialOrd + Default + Display,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(anyhow::anyhow!("invalid {name} {value}: must be greater than zero"))
    }
}

fn parse_flag(value: Option<String>, name: &str, default: bool) -> anyhow::Result<bool> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some("true" | "1") => Ok(true),
        Some("false" | "0") => Ok(false),
        Some(other) => Err(anyhow::anyhow!(
            "invalid {name} {other:?}: expected true or false"
        )),
    }
}

fn validate_http_url(raw: &str, label: &str) -> anyhow::Result<()> {
    let parsed =
        Url::parse(raw).map_err(|error| anyhow::anyhow!("invalid {label} URL {raw:?}: {error}"))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(anyhow::anyhow!(
            "invalid {label} URL {raw:?}: must use http or https"
        ));
    }
    Ok(())
}
