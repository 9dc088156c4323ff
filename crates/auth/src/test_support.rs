use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, Header};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::jwt::Claims;
use crate::jwt::{JWK, JWKS};

pub(crate) const ISSUER: &str = "https://accounts.example.com";

pub(crate) struct TestKeyPair {
    pub(crate) private: SigningKey,
    pub(crate) kid: String,
}

impl TestKeyPair {
    pub(crate) fn new(kid: &str, seed: u8) -> Self {
        Self {
            private: SigningKey::from_slice(&[seed; 32]).expect("valid scalar"),
            kid: kid.to_owned(),
        }
    }

    pub(crate) fn jwk(&self) -> JWK {
        let public = self.private.verifying_key().to_encoded_point(false);
        let public_bytes = public.as_bytes();
        let x = &public_bytes[1..33];
        let y = &public_bytes[33..65];
        JWK {
            kty: "EC".to_owned(),
            crv: Some("P-256".to_owned()),
            x: Some(URL_SAFE_NO_PAD.encode(x)),
            y: Some(URL_SAFE_NO_PAD.encode(y)),
            kid: Some(self.kid.clone()),
            alg: Some("ES256".to_owned()),
            use_: Some("sig".to_owned()),
            ..JWK::default()
        }
    }

    pub(crate) fn sign_token(&self, claims: &Claims) -> String {
        sign_es256_token(claims, Some(&self.kid), &self.private)
    }
}

pub(crate) struct TestServer {
    pub(crate) url: String,
    pub(crate) calls: Arc<AtomicUsize>,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// How the key endpoint answers every call after the first.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AfterFirst {
    Serve,
    Fail,
    Hang,
}

#[derive(Clone)]
struct JwksState {
    calls: Arc<AtomicUsize>,
    keys: Arc<Vec<JWK>>,
    after_first: AfterFirst,
}

async fn jwks_handler(State(state): State<JwksState>) -> impl IntoResponse {
    let call = state.calls.fetch_add(1, Ordering::SeqCst);
    if call > 0 {
        match state.after_first {
            AfterFirst::Serve => {}
            AfterFirst::Fail => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            AfterFirst::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return StatusCode::GATEWAY_TIMEOUT.into_response();
            }
        }
    }
    Json(JWKS {
        keys: (*state.keys).clone(),
    })
    .into_response()
}

pub(crate) async fn mock_jwks_server(keys: Vec<JWK>) -> TestServer {
    jwks_server(keys, AfterFirst::Serve).await
}

pub(crate) async fn mock_jwks_server_first_success_then_error(keys: Vec<JWK>) -> TestServer {
    jwks_server(keys, AfterFirst::Fail).await
}

pub(crate) async fn mock_jwks_server_first_success_then_hang(keys: Vec<JWK>) -> TestServer {
    jwks_server(keys, AfterFirst::Hang).await
}

/// Polls `calls` until it reaches `expected` or two seconds pass.
pub(crate) async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
    for _ in 0..200 {
        if calls.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn jwks_server(keys: Vec<JWK>, after_first: AfterFirst) -> TestServer {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = JwksState {
        calls: Arc::clone(&calls),
        keys: Arc::new(keys),
        after_first,
    };
    let app = Router::new().route("/", get(jwks_handler)).with_state(state);
    spawn_server(app, calls).await
}

#[derive(Clone)]
struct UserinfoState {
    calls: Arc<AtomicUsize>,
    subjects: Arc<HashMap<String, String>>,
}

async fn userinfo_handler(State(state): State<UserinfoState>, headers: HeaderMap) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    if let Some(subject) = state.subjects.get(token) {
        return Json(serde_json::json!({"sub": subject, "email": "a@example.com"})).into_response();
    }
    match token {
        "no-subject" => Json(serde_json::json!({"email": "a@example.com"})).into_response(),
        "flaky" => StatusCode::BAD_GATEWAY.into_response(),
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Userinfo endpoint at `<url>/userinfo` that knows `subjects` as
/// `(token, sub)` pairs. `no-subject` answers without a `sub`, `flaky`
/// answers 502, and anything else is rejected with 401.
pub(crate) async fn mock_userinfo_server(subjects: &[(&str, &str)]) -> TestServer {
    let calls = Arc::new(AtomicUsize::new(0));
    let state = UserinfoState {
        calls: Arc::clone(&calls),
        subjects: Arc::new(
            subjects
                .iter()
                .map(|(token, subject)| ((*token).to_owned(), (*subject).to_owned()))
                .collect(),
        ),
    };
    let app = Router::new()
        .route("/userinfo", get(userinfo_handler))
        .with_state(state);
    spawn_server(app, calls).await
}

pub(crate) async fn mock_server_error() -> TestServer {
    let app = Router::new().route("/", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
    spawn_server(app, Arc::new(AtomicUsize::new(0))).await
}

pub(crate) async fn spawn_server(app: Router, calls: Arc<AtomicUsize>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        url: format!("http://{addr}"),
        calls,
        stop: Some(tx),
    }
}

pub(crate) fn test_claims(issuer: &str, subject: &str) -> Claims {
    Claims {
        iss: issuer.to_owned(),
        sub: subject.to_owned(),
        aud: None,
        exp: Some(unix_now() + 60 * 60),
        nbf: None,
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be after epoch")
        .as_secs()
}

pub(crate) fn sign_es256_token(claims: &Claims, kid: Option<&str>, key: &SigningKey) -> String {
    let header = Header {
        alg: Algorithm::ES256,
        kid: kid.map(str::to_owned),
        typ: Some("JWT".to_owned()),
        ..Header::default()
    };
    let header = serde_json::to_vec(&header).expect("header");
    let claims = serde_json::to_vec(claims).expect("claims");
    let header = URL_SAFE_NO_PAD.encode(header);
    let claims = URL_SAFE_NO_PAD.encode(claims);
    let signing_input = format!("{header}.{claims}");
    let signature: Signature = key.sign(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(signature.to_bytes());
    format!("{signing_input}.{signature}")
}
