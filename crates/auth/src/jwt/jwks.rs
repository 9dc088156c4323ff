#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::DecodingKey;
use p256::PublicKey;
use reqwest::StatusCode;
use tokio::sync::{Mutex, RwLock};

pub const MAX_JWKS_SIZE: usize = 1 << 20;

/// Minimum gap between fetches triggered by an unknown `kid` while the cache is still fresh.
const MISSING_KEY_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct JWKS {
    pub keys: Vec<JWK>,
}

#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct JWK {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("failed to fetch JWKS: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("JWKS endpoint returned status {0}")]
    Status(StatusCode),
    #[error("JWKS payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("failed to decode JWKS: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("key {0:?} not found in JWKS")]
    KeyNotFound(Option<String>),
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),
    #[error("unsupported curve: {0:?}")]
    UnsupportedCurve(Option<String>),
    #[error("key is missing the {0} parameter")]
    MissingParameter(&'static str),
    #[error("key is not usable for signatures")]
    NotSigningKey,
    #[error("failed to decode X coordinate: {0}")]
    InvalidXCoordinate(#[source] base64::DecodeError),
    #[error("failed to decode Y coordinate: {0}")]
    InvalidYCoordinate(#[source] base64::DecodeError),
    #[error("invalid EC point: coordinate larger than 32 bytes")]
    CoordinateTooLarge,
    #[error("invalid EC point: not on curve")]
    PointNotOnCurve,
    #[error("failed to construct decoding key: {0}")]
    InvalidDecodingKey(#[source] jsonwebtoken::errors::Error),
}

impl JwksError {
    /// True when the key set itself could not be obtained, as opposed to the
    /// key set lacking the requested key.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Fetch(_) | Self::Status(_) | Self::PayloadTooLarge(_) | Self::Decode(_)
        )
    }
}

/// Signature family a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Ec,
    Rsa,
}

struct CachedKey {
    kid: Option<String>,
    family: KeyFamily,
    key: Arc<DecodingKey>,
}

#[derive(Default)]
struct JwksCacheState {
    keys: Vec<CachedKey>,
    /// Last successful fetch; drives the refresh TTL.
    last_fetch: Option<Instant>,
    /// Last fetch started, successful or not; drives the retry cooldown.
    last_attempt: Option<Instant>,
}

impl JwksCacheState {
    fn find(&self, kid: Option<&str>, family: KeyFamily) -> Option<Arc<DecodingKey>> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|cached| cached.family == family && cached.kid.as_deref() == Some(kid))
                .map(|cached| Arc::clone(&cached.key)),
            None => {
                let mut candidates = self.keys.iter().filter(|cached| cached.family == family);
                let first = candidates.next()?;
                if candidates.next().is_some() {
                    return None;
                }
                Some(Arc::clone(&first.key))
            }
        }
    }
}

/// Remote key set with a refresh TTL. A cached key is always served at
/// once; once the TTL passes it is refreshed in the background, and a failed
/// refresh keeps the previously fetched keys.
pub struct JwksClient {
    url: String,
    http_client: reqwest::Client,
    refresh_ttl: Duration,
    cache: Arc<RwLock<JwksCacheState>>,
    refresh_lock: Arc<Mutex<()>>,
}

impl JwksClient {
    #[must_use]
    pub fn new(url: impl Into<String>, refresh_ttl: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            url: url.into(),
            http_client,
            refresh_ttl,
            cache: Arc::new(RwLock::new(JwksCacheState::default())),
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn set_http_client(&mut self, http_client: reqwest::Client) {
        self.http_client = http_client;
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the key for `kid`, or the only key of `family` when the token
    /// carries no `kid`. Only a key missing from the cache waits on the network.
    pub async fn get_key(
        &self,
        kid: Option<&str>,
        family: KeyFamily,
    ) -> Result<Arc<DecodingKey>, JwksError> {
        let (cached, stale) = {
            let cache = self.cache.read().await;
            (
                cache.find(kid, family),
                is_stale(cache.last_fetch, self.refresh_ttl),
            )
        };
        if let Some(key) = cached {
            if stale {
                self.spawn_refresh();
            }
            return Ok(key);
        }

        let _guard = self.refresh_lock.lock().await;
        {
            let cache = self.cache.read().await;
            if let Some(key) = cache.find(kid, family) {
                return Ok(key);
            }
            if !is_stale(cache.last_attempt, self.retry_cooldown()) {
                return Err(JwksError::KeyNotFound(kid.map(str::to_owned)));
            }
        }

        fetch_keys(&self.http_client, &self.url, &self.cache).await?;
        self.cache
            .read()
            .await
            .find(kid, family)
            .ok_or_else(|| JwksError::KeyNotFound(kid.map(str::to_owned)))
    }

    fn retry_cooldown(&self) -> Duration {
        MISSING_KEY_COOLDOWN.min(self.refresh_ttl)
    }

    /// Starts a background refresh unless one is already running or the last
    /// attempt is inside the cooldown.
    fn spawn_refresh(&self) {
        let Ok(guard) = Arc::clone(&self.refresh_lock).try_lock_owned() else {
            return;
        };
        let http_client = self.http_client.clone();
        let url = self.url.clone();
        let cache = Arc::clone(&self.cache);
        let cooldown = self.retry_cooldown();
        tokio::spawn(async move {
            let _guard = guard;
            if !is_stale(cache.read().await.last_attempt, cooldown) {
                return;
            }
            if let Err(error) = fetch_keys(&http_client, &url, &cache).await {
                tracing::warn!(url = %url, error = %error, "JWKS refresh failed; serving cached keys");
            }
        });
    }
}

async fn fetch_keys(
    http_client: &reqwest::Client,
    url: &str,
    cache: &RwLock<JwksCacheState>,
) -> Result<(), JwksError> {
    cache.write().await.last_attempt = Some(Instant::now());

    let response = http_client.get(url).send().await?;
    if response.status() != StatusCode::OK {
        return Err(JwksError::Status(response.status()));
    }

    let payload = response.bytes().await?;
    if payload.len() > MAX_JWKS_SIZE {
        return Err(JwksError::PayloadTooLarge(payload.len()));
    }

    let jwks: JWKS = serde_json::from_slice(&payload)?;
    let mut keys = Vec::with_capacity(jwks.keys.len());
    for jwk in jwks.keys {
        match parse_jwk(&jwk) {
            Ok((family, key)) => keys.push(CachedKey {
                kid: jwk.kid,
                family,
                key: Arc::new(key),
            }),
            Err(error) => {
                tracing::debug!(kid = ?jwk.kid, error = %error, "skipping unusable JWK");
            }
        }
    }
    tracing::debug!(url = %url, keys = keys.len(), "refreshed JWKS");

    let mut cache = cache.write().await;
    cache.keys = keys;
    cache.last_fetch = Some(Instant::now());
    Ok(())
}

pub fn parse_jwk(jwk: &JWK) -> Result<(KeyFamily, DecodingKey), JwksError> {
    if jwk.use_.as_deref().is_some_and(|value| value != "sig") {
        return Err(JwksError::NotSigningKey);
    }
    match jwk.kty.as_str() {
        "EC" => parse_ec_jwk(jwk).map(|key| (KeyFamily::Ec, key)),
        "RSA" => parse_rsa_jwk(jwk).map(|key| (KeyFamily::Rsa, key)),
        other => Err(JwksError::UnsupportedKeyType(other.to_owned())),
    }
}

fn parse_ec_jwk(jwk: &JWK) -> Result<DecodingKey, JwksError> {
    if jwk.crv.as_deref() != Some("P-256") {
        return Err(JwksError::UnsupportedCurve(jwk.crv.clone()));
    }
    let x = jwk.x.as_deref().ok_or(JwksError::MissingParameter("x"))?;
    let y = jwk.y.as_deref().ok_or(JwksError::MissingParameter("y"))?;

    let x_bytes = URL_SAFE_NO_PAD
        .decode(x.as_bytes())
        .map_err(JwksError::InvalidXCoordinate)?;
    let y_bytes = URL_SAFE_NO_PAD
        .decode(y.as_bytes())
        .map_err(JwksError::InvalidYCoordinate)?;
    let x_bytes = pad_coordinate(&x_bytes)?;
    let y_bytes = pad_coordinate(&y_bytes)?;

    let mut sec1 = [0_u8; 65];
    sec1[0] = 0x04;
    sec1[1..33].copy_from_slice(&x_bytes);
    sec1[33..65].copy_from_slice(&y_bytes);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| JwksError::PointNotOnCurve)?;

    DecodingKey::from_ec_components(x, y).map_err(JwksError::InvalidDecodingKey)
}

fn parse_rsa_jwk(jwk: &JWK) -> Result<DecodingKey, JwksError> {
    let n = jwk.n.as_deref().ok_or(JwksError::MissingParameter("n"))?;
    let e = jwk.e.as_deref().ok_or(JwksError::MissingParameter("e"))?;
    DecodingKey::from_rsa_components(n, e).map_err(JwksError::InvalidDecodingKey)
}

fn is_stale(last_fetch: Option<Instant>, refresh_ttl: Duration) -> bool {
    if let Some(last_fetch) = last_fetch {
        last_fetch.elapsed() > refresh_ttl
    } else {
        true
    }
}

fn pad_coordinate(coord: &[u8]) -> Result<[u8; 32], JwksError> {
    if coord.len() > 32 {
        return Err(JwksError::CoordinateTooLarge);
    }
    let mut out = [0_u8; 32];
    let offset = 32 - coord.len();
    out[offset..].copy_from_slice(coord);
    Ok(out)
}
