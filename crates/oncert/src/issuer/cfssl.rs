//! CFSSL CA server backend.
//!
//! The CA certificate is discovered once from the `/info` endpoint and
//! appended to every signed leaf. Signing goes through `/sign`, or through
//! `/authsign` with the CFSSL standard authentication scheme (HMAC-SHA256
//! over the request body, keyed by a shared hex secret) when an auth key is
//! configured.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::certificate::CertBundle;
use crate::csr;
use crate::issuer::{CertConfig, Issuer};
use crate::{Error, Result};

/// Issues certificates from a CFSSL CA server.
pub struct CfsslIssuer {
    url: Url,
    profile: Option<String>,
    auth_key: Option<Vec<u8>>,
    client: reqwest::Client,
    ca_cert: tokio::sync::OnceCell<std::result::Result<String, Error>>,
}

impl CfsslIssuer {
    /// Creates an issuer against the CFSSL server at `url`.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            profile: None,
            auth_key: None,
            client: reqwest::Client::new(),
            ca_cert: tokio::sync::OnceCell::new(),
        }
    }

    /// Selects a signing profile. The server default is used otherwise.
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Enables standard authentication with the given hex-encoded key;
    /// signing then goes through `/authsign`.
    pub fn with_auth_key(mut self, hex_key: &str) -> Result<Self> {
        let key = hex::decode(hex_key)
            .map_err(|e| Error::Auth(format!("invalid CFSSL auth key: {e}")))?;
        self.auth_key = Some(key);
        Ok(self)
    }

    /// Uses a custom HTTP client (custom TLS roots, timeouts, proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn endpoint(&self, name: &str) -> Result<Url> {
        self.url
            .join(&format!("/api/v1/cfssl/{name}"))
            .map_err(|e| Error::Internal(format!("invalid CFSSL URL: {e}")))
    }

    /// Fetches and caches the CA certificate from `/info`. The first
    /// outcome, success or failure, is sticky.
    async fn ca_cert(&self) -> Result<String> {
        self.ca_cert
            .get_or_init(|| async {
                let body = InfoRequest {
                    profile: self.profile.as_deref(),
                };
                let info: InfoResult = self.post(self.endpoint("info")?, &body).await?;
                debug!("discovered CFSSL CA certificate");
                Ok(info.certificate)
            })
            .await
            .clone()
    }

    async fn post<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        body: &B,
    ) -> Result<R> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let api: ApiResponse<R> = response.json().await.map_err(|e| {
            Error::Upstream(format!("invalid CFSSL response ({status}): {e}"))
        })?;

        if !api.success {
            let detail = api
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(classify_cfssl_error(status, &detail));
        }
        api.result
            .ok_or_else(|| Error::Upstream("CFSSL response carried no result".to_string()))
    }
}

fn classify_cfssl_error(status: reqwest::StatusCode, detail: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Auth(detail.to_string()),
        400 | 422 => Error::Policy(detail.to_string()),
        _ => Error::Upstream(format!("{status}: {detail}")),
    }
}

#[derive(Serialize)]
struct InfoRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<&'a str>,
}

#[derive(Deserialize)]
struct InfoResult {
    certificate: String,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    certificate_request: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<&'a str>,
}

/// `/authsign` payload: the inner request, base64-encoded, plus an
/// HMAC-SHA256 token over its raw bytes.
#[derive(Serialize)]
struct AuthSignRequest {
    token: String,
    request: String,
}

#[derive(Deserialize)]
struct SignResult {
    certificate: String,
}

#[derive(Deserialize)]
struct ApiResponse<R> {
    #[serde(default)]
    success: bool,
    result: Option<R>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Computes the CFSSL standard-auth token for a request body.
fn auth_token(key: &[u8], request_json: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("invalid CFSSL auth key length: {e}")))?;
    mac.update(request_json);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl Issuer for CfsslIssuer {
    async fn issue(&self, common_name: &str, conf: &CertConfig) -> Result<CertBundle> {
        let ca_pem = self.ca_cert().await?;

        let request = csr::from_cert_config(common_name, conf)?;
        let sign = SignRequest {
            certificate_request: request.csr_pem(),
            profile: self.profile.as_deref(),
        };

        let signed: SignResult = match &self.auth_key {
            Some(key) => {
                let inner = serde_json::to_vec(&sign)
                    .map_err(|e| Error::Internal(format!("failed to encode sign request: {e}")))?;
                let body = AuthSignRequest {
                    token: auth_token(key, &inner)?,
                    request: base64::engine::general_purpose::STANDARD.encode(&inner),
                };
                self.post(self.endpoint("authsign")?, &body).await?
            }
            None => self.post(self.endpoint("sign")?, &sign).await?,
        };

        let chain_pem = format!("{}\n{}", signed.certificate, ca_pem);
        let (_, private_key) = request.into_parts();
        CertBundle::from_pem(&chain_pem, private_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_is_hmac_sha256_base64() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?"
        let token = auth_token(b"Jefe", b"what do ya want for nothing?").unwrap();
        let expected =
            hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
                .unwrap();
        assert_eq!(
            token,
            base64::engine::general_purpose::STANDARD.encode(expected)
        );
    }

    #[test]
    fn sign_request_uses_cfssl_field_names() {
        let sign = SignRequest {
            certificate_request: "CSR",
            profile: Some("server"),
        };
        let json = serde_json::to_value(&sign).unwrap();
        assert_eq!(json["certificate_request"], "CSR");
        assert_eq!(json["profile"], "server");

        let unprofiled = SignRequest {
            certificate_request: "CSR",
            profile: None,
        };
        let json = serde_json::to_value(&unprofiled).unwrap();
        assert!(json.get("profile").is_none());
    }

    #[test]
    fn rejects_non_hex_auth_key() {
        let url: Url = "https://cfssl.internal".parse().unwrap();
        assert!(CfsslIssuer::new(url).with_auth_key("not-hex").is_err());
    }
}
