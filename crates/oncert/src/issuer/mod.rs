//! Certificate issuer trait and backend implementations.
//!
//! An issuer is a CA-specific client: given a common name and a certificate
//! configuration it returns a usable TLS bundle. Backends included here:
//!
//! - [`vault`] - HashiCorp Vault PKI secrets engine
//! - [`cfssl`] - CFSSL CA server
//! - [`aws`] - AWS Certificate Manager Private CA
//! - [`cloudflare`] - Cloudflare Origin CA
//!
//! Every backend must return a chain containing at least the leaf and one CA
//! certificate, with the leaf metadata pre-parsed, and must classify
//! failures so callers can tell transport, authentication, policy and
//! upstream errors apart.

pub mod aws;
pub mod cfssl;
pub mod cloudflare;
pub mod vault;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::certificate::CertBundle;
use crate::keys::KeyGenerator;
use crate::Result;

/// A certificate issuer backed by some CA.
///
/// Implementations are shared across concurrent issuances on the same
/// instance; any discovered state (CA certificate, signing algorithm,
/// session token) lives inside the implementation.
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Issues a certificate for the given common name.
    ///
    /// The returned bundle carries the full chain (leaf first, at least one
    /// CA certificate after it), the private key, and parsed leaf metadata.
    async fn issue(&self, common_name: &str, conf: &CertConfig) -> Result<CertBundle>;
}

/// Parameters for a single certificate request.
///
/// The manager clones the config before mutating it, so a caller's config is
/// never observed after a handshake returns.
#[derive(Clone, Default)]
pub struct CertConfig {
    /// DNS subject alternative names, order preserved.
    pub dns_sans: Vec<String>,
    /// IP subject alternative names.
    pub ip_sans: Vec<IpAddr>,
    /// URI subject alternative names (e.g. SPIFFE IDs).
    pub uri_sans: Vec<String>,
    /// The key generator to use. When unset the manager falls back to its
    /// singleton P-256 generator.
    pub key_generator: Option<Arc<dyn KeyGenerator>>,
}

impl CertConfig {
    /// Creates an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the DNS subject alternative names.
    pub fn with_dns_sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns_sans = sans.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the IP subject alternative names.
    pub fn with_ip_sans(mut self, sans: Vec<IpAddr>) -> Self {
        self.ip_sans = sans;
        self
    }

    /// Sets the URI subject alternative names.
    pub fn with_uri_sans<I, S>(mut self, sans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uri_sans = sans.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the key generator.
    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Appends a name to the matching SAN list if not already present.
    /// Names that parse as IP addresses become IP SANs, everything else a
    /// DNS SAN.
    pub fn append_name(&mut self, name: &str) {
        if let Ok(ip) = name.parse::<IpAddr>() {
            if !self.ip_sans.contains(&ip) {
                self.ip_sans.push(ip);
            }
        } else if !self.dns_sans.iter().any(|dns| dns == name) {
            self.dns_sans.push(name.to_string());
        }
    }
}

impl fmt::Debug for CertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertConfig")
            .field("dns_sans", &self.dns_sans)
            .field("ip_sans", &self.ip_sans)
            .field("uri_sans", &self.uri_sans)
            .field("key_generator", &self.key_generator.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_name_routes_ips_to_ip_sans() {
        let mut conf = CertConfig::new();
        conf.append_name("8.8.8.8");
        conf.append_name("example.com");

        assert_eq!(conf.ip_sans, ["8.8.8.8".parse::<IpAddr>().unwrap()]);
        assert_eq!(conf.dns_sans, ["example.com"]);
    }

    #[test]
    fn append_name_deduplicates() {
        let mut conf = CertConfig::new().with_dns_sans(["example.com"]);
        conf.append_name("example.com");
        conf.append_name("example.com");

        assert_eq!(conf.dns_sans, ["example.com"]);
    }

    #[test]
    fn clone_is_independent() {
        let conf = CertConfig::new().with_dns_sans(["a.example.com"]);
        let mut cloned = conf.clone();
        cloned.append_name("b.example.com");

        assert_eq!(conf.dns_sans, ["a.example.com"]);
        assert_eq!(cloned.dns_sans, ["a.example.com", "b.example.com"]);
    }
}
