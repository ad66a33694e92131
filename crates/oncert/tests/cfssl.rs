//! CFSSL backend tests against a mocked CFSSL HTTP API, including the
//! standard (HMAC) authentication path.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use oncert::issuer::cfssl::CfsslIssuer;
use oncert::issuer::{CertConfig, Issuer};
use oncert::Error;
use support::TestCa;

const AUTH_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";

#[derive(Clone)]
struct CfsslState {
    ca: Arc<TestCa>,
    info_calls: Arc<Mutex<usize>>,
    sign_profiles: Arc<Mutex<Vec<Option<String>>>>,
}

async fn info(State(state): State<CfsslState>) -> Json<Value> {
    *state.info_calls.lock().unwrap() += 1;
    Json(json!({
        "success": true,
        "result": { "certificate": state.ca.root_pem() },
        "errors": [],
        "messages": []
    }))
}

fn sign_response(state: &CfsslState, request: &Value) -> Value {
    state
        .sign_profiles
        .lock()
        .unwrap()
        .push(request["profile"].as_str().map(str::to_string));

    let csr = request["certificate_request"].as_str().unwrap();
    let leaf = state.ca.sign_csr_pem(csr).unwrap();
    json!({
        "success": true,
        "result": { "certificate": leaf },
        "errors": [],
        "messages": []
    })
}

async fn sign(State(state): State<CfsslState>, Json(body): Json<Value>) -> Json<Value> {
    Json(sign_response(&state, &body))
}

async fn authsign(State(state): State<CfsslState>, Json(body): Json<Value>) -> Json<Value> {
    let token = body["token"].as_str().unwrap();
    let request_b64 = body["request"].as_str().unwrap();
    let request_bytes = base64::engine::general_purpose::STANDARD
        .decode(request_b64)
        .unwrap();

    // Recompute the standard-auth token over the raw request bytes.
    let key = hex::decode(AUTH_KEY_HEX).unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(&key).unwrap();
    mac.update(&request_bytes);
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    if token != expected {
        return Json(json!({
            "success": false,
            "result": null,
            "errors": [{ "code": 1000, "message": "invalid token" }]
        }));
    }

    let request: Value = serde_json::from_slice(&request_bytes).unwrap();
    Json(sign_response(&state, &request))
}

async fn serve(state: CfsslState) -> url::Url {
    let app = Router::new()
        .route("/api/v1/cfssl/info", post(info))
        .route("/api/v1/cfssl/sign", post(sign))
        .route("/api/v1/cfssl/authsign", post(authsign))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}").parse().unwrap()
}

fn cfssl_state() -> CfsslState {
    CfsslState {
        ca: Arc::new(TestCa::new(Duration::from_secs(3600))),
        info_calls: Arc::new(Mutex::new(0)),
        sign_profiles: Arc::new(Mutex::new(Vec::new())),
    }
}

#[tokio::test]
async fn signs_and_appends_discovered_ca() {
    let state = cfssl_state();
    let base = serve(state.clone()).await;

    let issuer = CfsslIssuer::new(base).with_profile("server");
    let conf = CertConfig::new().with_dns_sans(["myserver.com"]);

    let bundle = issuer.issue("myserver.com", &conf).await.unwrap();

    assert_eq!(bundle.chain().len(), 2);
    assert_eq!(bundle.leaf().subject_common_name(), "myserver.com");
    assert_eq!(
        state.sign_profiles.lock().unwrap().as_slice(),
        [Some("server".to_string())]
    );

    // A second issuance reuses the discovered CA certificate.
    issuer.issue("myserver.com", &conf).await.unwrap();
    assert_eq!(*state.info_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn authenticated_signing_uses_hmac_token() {
    let state = cfssl_state();
    let base = serve(state.clone()).await;

    let issuer = CfsslIssuer::new(base).with_auth_key(AUTH_KEY_HEX).unwrap();
    let bundle = issuer
        .issue("myserver.com", &CertConfig::new())
        .await
        .unwrap();

    assert_eq!(bundle.chain().len(), 2);
    assert_eq!(state.sign_profiles.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn wrong_auth_key_is_rejected() {
    let state = cfssl_state();
    let base = serve(state).await;

    let issuer = CfsslIssuer::new(base)
        .with_auth_key("deadbeefdeadbeefdeadbeefdeadbeef")
        .unwrap();
    let err = issuer
        .issue("myserver.com", &CertConfig::new())
        .await
        .unwrap_err();

    // The mock reports failure with HTTP 200, which maps to upstream.
    assert!(matches!(err, Error::Upstream(_)), "{err}");
}
