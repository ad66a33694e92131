//! Cloudflare Origin CA backend.
//!
//! Origin certificates are only ever presented to Cloudflare's edge, which
//! trusts two fixed roots. The API returns a bare leaf plus a
//! `request_type` tag; the matching built-in root (RSA or ECC) is appended
//! so the chain invariant holds. An unknown tag is an error rather than a
//! leaf-only chain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::certificate::CertBundle;
use crate::csr;
use crate::issuer::{CertConfig, Issuer};
use crate::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.cloudflare.com/client/v4/";

/// Certificate lifetime in days for a fifteen-year origin certificate, the
/// Cloudflare default.
pub const LIFETIME_FIFTEEN_YEARS: u32 = 15 * 365;
/// Certificate lifetime in days for a one-year origin certificate.
pub const LIFETIME_ONE_YEAR: u32 = 365;
/// Certificate lifetime in days for a thirty-day origin certificate.
pub const LIFETIME_THIRTY_DAYS: u32 = 30;
/// Certificate lifetime in days for a seven-day origin certificate.
pub const LIFETIME_SEVEN_DAYS: u32 = 7;

/// Credentials for the Cloudflare API.
pub enum OriginCaAuth {
    /// An origin CA service key (`v1.0-...`).
    ServiceKey(String),
    /// A global API key plus account email.
    KeyEmail {
        /// The API key.
        key: String,
        /// The account email address.
        email: String,
    },
}

/// Issues certificates from the Cloudflare Origin CA API.
pub struct OriginCaIssuer {
    auth: OriginCaAuth,
    base: Option<Url>,
    validity_days: u32,
    client: reqwest::Client,
}

impl OriginCaIssuer {
    /// Creates an issuer using the given credentials against the public
    /// Cloudflare API.
    pub fn new(auth: OriginCaAuth) -> Self {
        Self {
            auth,
            base: None,
            validity_days: LIFETIME_FIFTEEN_YEARS,
            client: reqwest::Client::new(),
        }
    }

    /// Points the issuer at a different API base URL.
    pub fn with_base_url(mut self, base: Url) -> Self {
        self.base = Some(base);
        self
    }

    fn certificates_endpoint(&self) -> Result<Url> {
        let base = match &self.base {
            Some(base) => base.clone(),
            None => Url::parse(DEFAULT_API_BASE)
                .map_err(|e| Error::Internal(format!("invalid Cloudflare API base: {e}")))?,
        };
        base.join("certificates")
            .map_err(|e| Error::Internal(format!("invalid Cloudflare URL: {e}")))
    }

    /// Requests the given certificate lifetime in days. Cloudflare accepts
    /// 7, 30, 90, 365, 730, 1095 and 5475.
    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Uses a custom HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            OriginCaAuth::ServiceKey(key) => request.header("X-Auth-User-Service-Key", key),
            OriginCaAuth::KeyEmail { key, email } => request
                .header("X-Auth-Key", key)
                .header("X-Auth-Email", email),
        }
    }
}

#[derive(Serialize)]
struct CreateCertificateRequest<'a> {
    csr: &'a str,
    hostnames: Vec<String>,
    request_type: &'static str,
    requested_validity: u32,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    success: bool,
    result: Option<OriginCertificate>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct OriginCertificate {
    certificate: String,
    #[serde(default)]
    request_type: String,
}

#[async_trait]
impl Issuer for OriginCaIssuer {
    async fn issue(&self, common_name: &str, conf: &CertConfig) -> Result<CertBundle> {
        let request = csr::from_cert_config(common_name, conf)?;

        let mut hostnames: Vec<String> = conf.dns_sans.clone();
        hostnames.extend(conf.ip_sans.iter().map(|ip| ip.to_string()));

        let body = CreateCertificateRequest {
            csr: request.csr_pem(),
            hostnames,
            request_type: if request.private_key().is_rsa() {
                "origin-rsa"
            } else {
                "origin-ecc"
            },
            requested_validity: self.validity_days,
        };

        let url = self.certificates_endpoint()?;
        debug!(%url, request_type = body.request_type, "requesting origin certificate");

        let response = self
            .apply_auth(self.client.post(url).json(&body))
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
        let api: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid Cloudflare response ({status}): {e}")))?;

        if !api.success {
            return Err(classify_cloudflare_error(status, &api.errors));
        }
        let cert = api
            .result
            .ok_or_else(|| Error::Upstream("Cloudflare response carried no result".to_string()))?;

        let root = match cert.request_type.as_str() {
            "origin-rsa" => CLOUDFLARE_RSA_ROOT,
            "origin-ecc" => CLOUDFLARE_ECC_ROOT,
            other => {
                return Err(Error::Unsupported(format!(
                    "unknown origin certificate request type: {other:?}"
                )))
            }
        };

        let chain_pem = format!("{}\n{}", cert.certificate, root);
        let (_, private_key) = request.into_parts();
        CertBundle::from_pem(&chain_pem, private_key)
    }
}

fn classify_cloudflare_error(status: reqwest::StatusCode, errors: &[ApiError]) -> Error {
    let detail = errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ");
    match status.as_u16() {
        401 | 403 => Error::Auth(detail),
        400 | 422 => Error::Policy(detail),
        _ => Error::Upstream(format!("{status}: {detail}")),
    }
}

// The two roots Cloudflare's edge chains origin certificates to:
// https://developers.cloudflare.com/ssl/origin-configuration/origin-ca/
const CLOUDFLARE_RSA_ROOT: &str = "-----BEGIN CERTIFICATE-----
MIID/DCCAuagAwIBAgIID+rOSdTGfGcwCwYJKoZIhvcNAQELMIGLMQswCQYDVQQG
EwJVUzEZMBcGA1UEChMQQ2xvdWRGbGFyZSwgSW5jLjE0MDIGA1UECxMrQ2xvdWRG
bGFyZSBPcmlnaW4gU1NMIENlcnRpZmljYXRlIEF1dGhvcml0eTEWMBQGA1UEBxMN
U2FuIEZyYW5jaXNjbzETMBEGA1UECBMKQ2FsaWZvcm5pYTAeFw0xNDExMTMyMDM4
NTBaFw0xOTExMTQwMTQzNTBaMIGLMQswCQYDVQQGEwJVUzEZMBcGA1UEChMQQ2xv
dWRGbGFyZSwgSW5jLjE0MDIGA1UECxMrQ2xvdWRGbGFyZSBPcmlnaW4gU1NMIENl
cnRpZmljYXRlIEF1dGhvcml0eTEWMBQGA1UEBxMNU2FuIEZyYW5jaXNjbzETMBEG
A1UECBMKQ2FsaWZvcm5pYTCCASIwDQYJKoZIhvcNAQEBBQADggEPADCCAQoCggEB
AMBIlWf1KEKR5hbB75OYrAcUXobpD/AxvSYRXr91mbRu+lqE7YbyyRUShQh15lem
ef+umeEtPZoLFLhcLyczJxOhI+siLGDQm/a/UDkWvAXYa5DZ+pHU5ct5nZ8pGzqJ
p8G1Hy5RMVYDXZT9F6EaHjMG0OOffH6Ih25TtgfyyrjXycwDH0u6GXt+G/rywcqz
/9W4Aki3XNQMUHNQAtBLEEIYHMkyTYJxuL2tXO6ID5cCsoWw8meHufTeZW2DyUpl
yP3AHt4149RQSyWZMJ6AyntL9d8Xhfpxd9rJkh9Kge2iV9rQTFuE1rRT5s7OSJcK
xUsklgHcGHYMcNfNMilNHb8CAwEAAaNmMGQwDgYDVR0PAQH/BAQDAgAGMBIGA1Ud
EwEB/wQIMAYBAf8CAQIwHQYDVR0OBBYEFCToU1ddfDRAh6nrlNu64RZ4/CmkMB8G
A1UdIwQYMBaAFCToU1ddfDRAh6nrlNu64RZ4/CmkMAsGCSqGSIb3DQEBCwOCAQEA
cQDBVAoRrhhsGegsSFsv1w8v27zzHKaJNv6ffLGIRvXK8VKKK0gKXh2zQtN9SnaD
gYNe7Pr4C3I8ooYKRJJWLsmEHdGdnYYmj0OJfGrfQf6MLIc/11bQhLepZTxdhFYh
QGgDl6gRmb8aDwk7Q92BPvek5nMzaWlP82ixavvYI+okoSY8pwdcVKobx6rWzMWz
ZEC9M6H3F0dDYE23XcCFIdgNSAmmGyXPBstOe0aAJXwJTxOEPn36VWr0PKIQJy5Y
4o1wpMpqCOIwWc8J9REV/REzN6Z1LXImdUgXIXOwrz56gKUJzPejtBQyIGj0mveX
Fu6q54beR89jDc+oABmOgg==
-----END CERTIFICATE-----";

const CLOUDFLARE_ECC_ROOT: &str = "-----BEGIN CERTIFICATE-----
MIICiDCCAi6gAwIBAgIUXZP3MWb8MKwBE1Qbawsp1sfA/Y4wCgYIKoZIzj0EAwIw
gY8xCzAJBgNVBAYTAlVTMRMwEQYDVQQIEwpDYWxpZm9ybmlhMRYwFAYDVQQHEw1T
YW4gRnJhbmNpc2NvMRkwFwYDVQQKExBDbG91ZEZsYXJlLCBJbmMuMTgwNgYDVQQL
Ey9DbG91ZEZsYXJlIE9yaWdpbiBTU0wgRUNDIENlcnRpZmljYXRlIEF1dGhvcml0
eTAeFw0xNjAyMjIxODI0MDBaFw0yMTAyMjIwMDI0MDBaMIGPMQswCQYDVQQGEwJV
UzETMBEGA1UECBMKQ2FsaWZvcm5pYTEWMBQGA1UEBxMNU2FuIEZyYW5jaXNjbzEZ
MBcGA1UEChMQQ2xvdWRGbGFyZSwgSW5jLjE4MDYGA1UECxMvQ2xvdWRGbGFyZSBP
cmlnaW4gU1NMIEVDQyBDZXJ0aWZpY2F0ZSBBdXRob3JpdHkwWTATBgcqhkjOPQIB
BggqhkjOPQMBBwNCAASR+sGALuaGshnUbcxKry+0LEXZ4NY6JUAtSeA6g87K3jaA
xpIg9G50PokpfWkhbarLfpcZu0UAoYy2su0EhN7wo2YwZDAOBgNVHQ8BAf8EBAMC
AQYwEgYDVR0TAQH/BAgwBgEB/wIBAjAdBgNVHQ4EFgQUhTBdOypw1O3VkmcH/es5
tBoOOKcwHwYDVR0jBBgwFoAUhTBdOypw1O3VkmcH/es5tBoOOKcwCgYIKoZIzj0E
AwIDSAAwRQIgEiIEHQr5UKma50D1WRMJBUSgjg24U8n8E2mfw/8UPz0CIQCr5V/e
mcifak4CQsr+DH4pn5SJD7JxtCG3YGswW8QZsw==
-----END CERTIFICATE-----";
