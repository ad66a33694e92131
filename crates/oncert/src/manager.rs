//! Certificate manager: the handshake-facing orchestrator.
//!
//! [`CertManager`] exposes the two TLS hooks: the server-side certificate
//! selector (identity derived from the requested server name) and the
//! client-side selector (identity is the configured common name). Each call
//! consults the cache, applies the renewal window, coalesces concurrent
//! requests for the same identity, and falls through to the configured
//! issuer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::certificate::CertBundle;
use crate::identity::Identity;
use crate::issuer::{CertConfig, Issuer};
use crate::keys::SingletonKeyGenerator;
use crate::singleflight::{self, Group};
use crate::{Error, Result};

/// Upper bound on the time allowed per certificate call when the caller sets
/// none.
const DEFAULT_ISSUE_TIMEOUT: Duration = Duration::from_secs(60);

type IssueOutcome = std::result::Result<Arc<CertBundle>, Error>;

/// Automatic certificate acquisition for TLS endpoints.
///
/// A manager is cheap to share: both hooks take `&self` and are safe to call
/// from any number of concurrent handshakes. Bundles returned from the
/// manager are shared and must not be mutated.
pub struct CertManager {
    common_name: String,
    issuer: Arc<dyn Issuer>,
    cache: Option<Arc<dyn Cache>>,
    cert_config: CertConfig,
    renew_before: Duration,
    issue_timeout: Duration,
    default_generator: Arc<SingletonKeyGenerator>,
    issue_group: Group<IssueOutcome>,
}

impl CertManager {
    /// Creates a manager issuing certificates with the given common name
    /// from `issuer`.
    pub fn new(common_name: impl Into<String>, issuer: Arc<dyn Issuer>) -> Self {
        Self {
            common_name: common_name.into(),
            issuer,
            cache: None,
            cert_config: CertConfig::default(),
            renew_before: Duration::ZERO,
            issue_timeout: DEFAULT_ISSUE_TIMEOUT,
            default_generator: Arc::new(SingletonKeyGenerator::new()),
            issue_group: Group::new(),
        }
    }

    /// Configures a cache. Without one, every handshake triggers an
    /// issuance.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Configures how long before expiry a cached certificate is considered
    /// too old to use and is renewed on the next request.
    pub fn with_renew_before(mut self, window: Duration) -> Self {
        self.renew_before = window;
        self
    }

    /// Configures the per-call deadline. Defaults to 60 seconds.
    pub fn with_issue_timeout(mut self, timeout: Duration) -> Self {
        self.issue_timeout = timeout;
        self
    }

    /// Configures explicit certificate requirements (extra SANs, a custom
    /// key generator).
    pub fn with_cert_config(mut self, config: CertConfig) -> Self {
        self.cert_config = config;
        self
    }

    /// Returns the configured common name.
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    /// Server-side handshake hook: returns a certificate for the server
    /// name requested by the client hello.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServerName`] for empty names or names
    /// containing `/` or `\`; [`Error::Timeout`] when the issue deadline
    /// fires; otherwise whatever the cache or issuer surfaced.
    pub async fn select_server_certificate(&self, server_name: &str) -> Result<Arc<CertBundle>> {
        let identity = Identity::from_server_name(server_name)?;
        self.get_or_renew(identity).await
    }

    /// Client-side handshake hook: returns a certificate for the configured
    /// common name.
    pub async fn select_client_certificate(&self) -> Result<Arc<CertBundle>> {
        let identity = Identity::from_common_name(&self.common_name);
        self.get_or_renew(identity).await
    }

    async fn get_or_renew(&self, identity: Identity) -> Result<Arc<CertBundle>> {
        match timeout(self.issue_timeout, self.get_or_renew_inner(identity)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn get_or_renew_inner(&self, identity: Identity) -> Result<Arc<CertBundle>> {
        if let Some(cache) = &self.cache {
            if let Some(bundle) = cache.get(identity.as_str()).await? {
                if !bundle.expires_within(self.renew_window()) {
                    debug!(identity = %identity, "using cached certificate");
                    return Ok(bundle);
                }
                // Inside the renewal window: evict and issue fresh.
                debug!(identity = %identity, "cached certificate needs renewal");
                let _ = cache.delete(identity.as_str()).await;
            }
        }

        let rx = self
            .issue_group
            .join(identity.as_str(), self.issue_task(identity.clone()));
        singleflight::wait(rx).await?
    }

    /// Builds the detached issuance task for `identity`. The task owns
    /// clones of everything it touches so it can outlive the caller that
    /// spawned it; a joiner hitting its deadline does not abort the
    /// issuance, and a late success still populates the cache.
    fn issue_task(
        &self,
        identity: Identity,
    ) -> impl std::future::Future<Output = IssueOutcome> + Send + 'static {
        let issuer = Arc::clone(&self.issuer);
        let cache = self.cache.clone();
        let common_name = self.common_name.clone();
        let mut conf = self.cert_config.clone();
        let default_generator = Arc::clone(&self.default_generator);
        let issue_timeout = self.issue_timeout;

        async move {
            conf.append_name(identity.as_str());
            if conf.key_generator.is_none() {
                conf.key_generator = Some(default_generator);
            }
            if identity.as_str() != common_name {
                conf.append_name(&common_name);
            }

            let issued = timeout(issue_timeout, issuer.issue(&common_name, &conf)).await;
            let bundle = match issued {
                Ok(Ok(bundle)) => Arc::new(bundle),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::Timeout),
            };

            info!(
                identity = %identity,
                serial = bundle.leaf().serial(),
                not_after = %bundle.leaf().not_after(),
                "issued certificate"
            );

            if let Some(cache) = cache {
                // A failed write just means we issue again next time.
                if let Err(e) = cache.put(identity.as_str(), Arc::clone(&bundle)).await {
                    warn!(identity = %identity, error = %e, "failed to cache certificate");
                }
            }

            Ok(bundle)
        }
    }

    fn renew_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.renew_before).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("common_name", &self.common_name)
            .field("renew_before", &self.renew_before)
            .field("issue_timeout", &self.issue_timeout)
            .field("cached", &self.cache.is_some())
            .finish()
    }
}
