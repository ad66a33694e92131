//! HashiCorp Vault PKI secrets engine backend.
//!
//! Certificates are signed by POSTing a locally generated CSR to
//! `/v1/<mount>/sign/<role>`. The Vault parameter encoding is matched
//! exactly: SAN lists are comma-separated strings, the CSR is PEM, and
//! `exclude_cn_from_sans` / `format=pem` are always sent.
//!
//! Authentication is pluggable through [`AuthMethod`]: a static token
//! ([`ConstantToken`]) or a token kept alive by a background renewal task
//! ([`RenewingToken`]).

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};
use url::Url;

use crate::certificate::CertBundle;
use crate::csr;
use crate::issuer::{CertConfig, Issuer};
use crate::{Error, Result};

/// Sets the token used for Vault requests.
///
/// Implementations may keep the token fresh in the background; [`token`] is
/// called before every sign request and must return the current value.
///
/// [`token`]: AuthMethod::token
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// Returns the token to present on the next request.
    async fn token(&self, client: &reqwest::Client, base: &Url) -> Result<String>;

    /// Stops any background work. Must be called for renewing tokens; the
    /// renewal task is otherwise leaked.
    fn close(&self) {}
}

/// A static Vault token that never expires.
pub struct ConstantToken {
    token: String,
}

impl ConstantToken {
    /// Creates an auth method presenting `token` on every request.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthMethod for ConstantToken {
    async fn token(&self, _client: &reqwest::Client, _base: &Url) -> Result<String> {
        Ok(self.token.clone())
    }
}

/// A renewable Vault token kept alive by a background task.
///
/// On first use the token's renewability and TTL are looked up; a
/// non-renewable token is an error. The task then sleeps until
/// `ttl - renew_before` (never less than one second) and calls
/// `/v1/auth/token/renew-self` with the configured increment. Each
/// successful renewal replaces the shared token; a renewal failure is
/// parked in a one-slot channel, surfaced to the next [`token`] call, and
/// stops the task. [`close`] stops a healthy task.
///
/// [`token`]: AuthMethod::token
/// [`close`]: RenewingToken::close
pub struct RenewingToken {
    initial: String,
    renew_before: Duration,
    increment: Duration,
    current: Arc<Mutex<String>>,
    errors: Mutex<mpsc::Receiver<Error>>,
    error_slot: mpsc::Sender<Error>,
    started: tokio::sync::OnceCell<std::result::Result<(), Error>>,
    shutdown: watch::Sender<bool>,
}

impl RenewingToken {
    /// Creates a renewing auth method.
    ///
    /// `renew_before` is how long before the token TTL elapses that renewal
    /// runs; `increment` is the TTL requested on each renewal.
    pub fn new(initial: impl Into<String>, renew_before: Duration, increment: Duration) -> Self {
        let (error_slot, errors) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let initial = initial.into();
        Self {
            current: Arc::new(Mutex::new(initial.clone())),
            initial,
            renew_before,
            increment,
            errors: Mutex::new(errors),
            error_slot,
            started: tokio::sync::OnceCell::new(),
            shutdown,
        }
    }

    /// Stops the background renewal task.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn start(&self, client: &reqwest::Client, base: &Url) -> std::result::Result<(), Error> {
        let lookup = lookup_self(client, base, &self.initial).await?;
        if !lookup.renewable {
            return Err(Error::Auth("vault token is not renewable".to_string()));
        }

        let client = client.clone();
        let base = base.clone();
        let current = Arc::clone(&self.current);
        let renew_before = self.renew_before;
        let increment = self.increment;
        let error_slot = self.error_slot.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut token = self.initial.clone();
        let mut ttl = Duration::from_secs(lookup.ttl);

        tokio::spawn(async move {
            loop {
                let sleep_for = ttl.saturating_sub(renew_before).max(Duration::from_secs(1));
                tokio::select! {
                    () = tokio::time::sleep(sleep_for) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("vault token renewal task shutting down");
                            return;
                        }
                        continue;
                    }
                }

                match renew_self(&client, &base, &token, increment).await {
                    Ok(renewed) => {
                        debug!(lease = renewed.lease_duration, "renewed vault token");
                        token = renewed.client_token;
                        ttl = Duration::from_secs(renewed.lease_duration);
                        *current.lock().await = token.clone();
                    }
                    Err(e) => {
                        warn!(error = %e, "vault token renewal failed");
                        let _ = error_slot.try_send(e);
                        return;
                    }
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl AuthMethod for RenewingToken {
    async fn token(&self, client: &reqwest::Client, base: &Url) -> Result<String> {
        self.started
            .get_or_init(|| self.start(client, base))
            .await
            .clone()?;

        if let Ok(e) = self.errors.lock().await.try_recv() {
            return Err(e);
        }

        Ok(self.current.lock().await.clone())
    }

    fn close(&self) {
        RenewingToken::close(self);
    }
}

#[derive(Deserialize)]
struct LookupData {
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    ttl: u64,
}

#[derive(Deserialize)]
struct LookupResponse {
    data: LookupData,
}

#[derive(Deserialize)]
struct RenewAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Deserialize)]
struct RenewResponse {
    auth: RenewAuth,
}

async fn lookup_self(client: &reqwest::Client, base: &Url, token: &str) -> Result<LookupData> {
    let url = vault_url(base, "auth/token/lookup-self")?;
    let response = client
        .get(url)
        .header("X-Vault-Token", token)
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response).await?;
    let body: LookupResponse = response
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("invalid token lookup response: {e}")))?;
    Ok(body.data)
}

async fn renew_self(
    client: &reqwest::Client,
    base: &Url,
    token: &str,
    increment: Duration,
) -> Result<RenewAuth> {
    let url = vault_url(base, "auth/token/renew-self")?;
    let response = client
        .post(url)
        .header("X-Vault-Token", token)
        .json(&serde_json::json!({ "increment": format!("{}s", increment.as_secs()) }))
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_status(response).await?;
    let body: RenewResponse = response
        .json()
        .await
        .map_err(|e| Error::Upstream(format!("invalid token renew response: {e}")))?;
    Ok(body.auth)
}

/// Sign request body, per the Vault PKI API. SAN lists are comma-separated
/// strings, not JSON arrays.
#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    csr: &'a str,
    common_name: &'a str,
    exclude_cn_from_sans: bool,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    alt_names: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_sans: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uri_sans: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    other_sans: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<String>,
}

/// A Vault secret response, reduced to the PKI sign fields we consume.
#[derive(Debug, Default, Deserialize)]
struct Secret {
    #[serde(default)]
    data: Option<SecretData>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretData {
    certificate: Option<String>,
    ca_chain: Option<Vec<String>>,
    issuing_ca: Option<String>,
}

/// Issues certificates from a Vault PKI secrets engine.
pub struct VaultIssuer {
    url: Url,
    role: String,
    mount: String,
    auth: Arc<dyn AuthMethod>,
    ttl: Option<Duration>,
    other_sans: Vec<String>,
    ca_cert_pem: Option<Vec<u8>>,
    client: OnceLock<std::result::Result<reqwest::Client, Error>>,
}

impl VaultIssuer {
    /// Creates an issuer signing against `role` on the Vault server at
    /// `url`, using the default `pki` mount.
    pub fn new(url: Url, role: impl Into<String>, auth: Arc<dyn AuthMethod>) -> Self {
        Self {
            url,
            role: role.into(),
            mount: "pki".to_string(),
            auth,
            ttl: None,
            other_sans: Vec::new(),
            ca_cert_pem: None,
            client: OnceLock::new(),
        }
    }

    /// Uses a PKI secrets engine mounted somewhere other than `pki`.
    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    /// Requests the given lifetime for issued certificates.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adds custom OID/UTF8-string SANs, in OpenSSL `<oid>;UTF8:<value>`
    /// format.
    pub fn with_other_sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.other_sans = sans.into_iter().map(Into::into).collect();
        self
    }

    /// Trusts the given PEM CA certificate when connecting to Vault.
    pub fn with_ca_cert_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert_pem = Some(pem);
        self
    }

    /// Stops the auth method's background work, if any.
    pub fn close(&self) {
        self.auth.close();
    }

    fn client(&self) -> Result<reqwest::Client> {
        self.client
            .get_or_init(|| {
                let mut builder = reqwest::Client::builder();
                if let Some(pem) = &self.ca_cert_pem {
                    let cert = reqwest::Certificate::from_pem(pem)
                        .map_err(|e| Error::Certificate(format!("invalid vault CA cert: {e}")))?;
                    builder = builder.add_root_certificate(cert);
                }
                builder
                    .build()
                    .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))
            })
            .clone()
    }

    async fn sign_csr(
        &self,
        client: &reqwest::Client,
        token: &str,
        body: &SignRequest<'_>,
    ) -> Result<Secret> {
        let url = vault_url(&self.url, &format!("{}/sign/{}", self.mount, self.role))?;
        debug!(%url, common_name = body.common_name, "signing CSR with vault");

        let response = client
            .post(url)
            .header("X-Vault-Token", token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        // A 404 can still carry a partial secret whose warnings explain the
        // failure (unknown role, unmounted engine).
        if response.status() == StatusCode::NOT_FOUND {
            let secret = response.json::<Secret>().await.unwrap_or_default();
            if !secret.warnings.is_empty() {
                return Err(Error::Policy(secret.warnings.join("; ")));
            }
            if secret
                .data
                .as_ref()
                .is_some_and(|data| data.certificate.is_some())
            {
                return Ok(secret);
            }
            return Err(Error::Upstream(format!(
                "vault sign endpoint not found for mount {:?} role {:?}",
                self.mount, self.role
            )));
        }

        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid vault sign response: {e}")))
    }
}

#[async_trait]
impl Issuer for VaultIssuer {
    async fn issue(&self, common_name: &str, conf: &CertConfig) -> Result<CertBundle> {
        let client = self.client()?;
        let token = self.auth.token(&client, &self.url).await?;

        let request = csr::from_cert_config(common_name, conf)?;
        let body = SignRequest {
            csr: request.csr_pem(),
            common_name,
            exclude_cn_from_sans: true,
            format: "pem",
            alt_names: join_nonempty(&conf.dns_sans),
            ip_sans: join_nonempty(
                &conf
                    .ip_sans
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>(),
            ),
            uri_sans: join_nonempty(&conf.uri_sans),
            other_sans: join_nonempty(&self.other_sans),
            ttl: self.ttl.map(|ttl| format!("{}s", ttl.as_secs())),
        };

        let secret = self.sign_csr(&client, &token, &body).await?;
        let data = secret.data.unwrap_or_default();

        let certificate = data
            .certificate
            .ok_or_else(|| Error::Upstream("vault response carried no certificate".to_string()))?;

        let mut chain_pem = certificate;
        if let Some(ca_chain) = data.ca_chain {
            for ca in ca_chain {
                chain_pem.push('\n');
                chain_pem.push_str(&ca);
            }
        } else if let Some(issuing_ca) = data.issuing_ca {
            chain_pem.push('\n');
            chain_pem.push_str(&issuing_ca);
        }

        let (_, private_key) = request.into_parts();
        CertBundle::from_pem(&chain_pem, private_key)
    }
}

fn vault_url(base: &Url, path: &str) -> Result<Url> {
    base.join(&format!("/v1/{path}"))
        .map_err(|e| Error::Internal(format!("invalid vault URL: {e}")))
}

fn join_nonempty(values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Transport(e.to_string())
    }
}

/// Maps a non-success Vault status to the error taxonomy.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let errors = response
        .json::<Secret>()
        .await
        .map(|s| s.errors.join("; "))
        .unwrap_or_default();
    let detail = if errors.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {errors}")
    };

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::Policy(detail),
        _ => Error::Upstream(detail),
    })
}
