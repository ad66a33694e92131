//! Certificate chain and bundle types.
//!
//! A [`CertBundle`] is the product of an issuance: the DER chain (leaf
//! first), the matching private key and the pre-parsed leaf metadata the
//! manager needs for renewal decisions. Issuers construct bundles with
//! [`CertBundle::from_pem`], which also enforces that the leaf parses.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::parse_x509_certificate;

use crate::keys::PrivateKey;
use crate::{Error, Result};

/// An X.509 certificate held as DER with a cached PEM rendering.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    pem: String,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        Self { der, pem }
    }

    /// Creates a certificate from a single PEM `CERTIFICATE` block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let block = pem::parse(pem_str)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate PEM: {e}")))?;
        if block.tag() != "CERTIFICATE" {
            return Err(Error::Unsupported(format!(
                "unexpected PEM label: {}",
                block.tag()
            )));
        }
        Ok(Self::from_der(block.into_contents()))
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }
}

/// Metadata parsed once from a leaf certificate.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    subject_common_name: String,
    issuer_common_name: String,
    serial: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    dns_names: Vec<String>,
    ip_addresses: Vec<IpAddr>,
    uris: Vec<String>,
}

impl LeafInfo {
    /// Parses leaf metadata from a DER-encoded certificate.
    pub fn parse(der: &[u8]) -> Result<Self> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| Error::Certificate(format!("failed to parse leaf certificate: {e}")))?;

        let subject_common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let issuer_common_name = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let serial = cert.raw_serial_as_string();

        let not_before = timestamp(cert.validity().not_before.timestamp(), "not_before")?;
        let not_after = timestamp(cert.validity().not_after.timestamp(), "not_after")?;

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        let mut uris = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push((*dns).to_string()),
                        GeneralName::URI(uri) => uris.push((*uri).to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                ip_addresses.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        Ok(Self {
            subject_common_name,
            issuer_common_name,
            serial,
            not_before,
            not_after,
            dns_names,
            ip_addresses,
            uris,
        })
    }

    /// Returns the subject common name.
    pub fn subject_common_name(&self) -> &str {
        &self.subject_common_name
    }

    /// Returns the issuer common name.
    pub fn issuer_common_name(&self) -> &str {
        &self.issuer_common_name
    }

    /// Returns the serial number as a colon-separated hex string.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Returns the start of the validity period.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// Returns the expiry time.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Returns the DNS subject alternative names.
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Returns the IP subject alternative names.
    pub fn ip_addresses(&self) -> &[IpAddr] {
        &self.ip_addresses
    }

    /// Returns the URI subject alternative names.
    pub fn uris(&self) -> &[String] {
        &self.uris
    }
}

/// A usable TLS certificate: the chain (leaf first, then the issuing CA
/// chain), the leaf's private key, and the leaf metadata parsed at
/// construction time.
///
/// Bundles handed out by the manager are shared between concurrent
/// handshakes and must be treated as immutable.
#[derive(Debug, Clone)]
pub struct CertBundle {
    chain: Vec<Certificate>,
    private_key: PrivateKey,
    leaf: LeafInfo,
}

impl CertBundle {
    /// Builds a bundle from a PEM-concatenated chain (leaf first) and the
    /// matching private key, parsing the leaf in the process.
    ///
    /// # Errors
    ///
    /// Fails if the chain is empty or the leaf does not parse.
    pub fn from_pem(chain_pem: &str, private_key: PrivateKey) -> Result<Self> {
        let chain = parse_chain_pem(chain_pem)?;
        if chain.is_empty() {
            return Err(Error::Certificate("empty certificate chain".to_string()));
        }
        let leaf = LeafInfo::parse(chain[0].der())?;
        Ok(Self {
            chain,
            private_key,
            leaf,
        })
    }

    /// Returns the certificate chain, leaf first.
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// Returns the parsed leaf metadata.
    pub fn leaf(&self) -> &LeafInfo {
        &self.leaf
    }

    /// Returns the private key.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Returns `true` if the leaf expires within the given window of now.
    pub fn expires_within(&self, window: chrono::Duration) -> bool {
        Utc::now() + window >= self.leaf.not_after
    }

    /// Returns the chain as concatenated PEM, leaf first.
    pub fn chain_pem(&self) -> String {
        self.chain
            .iter()
            .map(|c| c.to_pem())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Converts the bundle into a rustls `CertifiedKey`, for use with a
    /// certificate resolver.
    pub fn to_certified_key(&self) -> Result<rustls::sign::CertifiedKey> {
        let certs: Vec<rustls::pki_types::CertificateDer<'static>> = self
            .chain
            .iter()
            .map(|c| rustls::pki_types::CertificateDer::from(c.der().to_vec()))
            .collect();

        let key_der = rustls::pki_types::PrivateKeyDer::try_from(self.private_key.to_pkcs8_der()?)
            .map_err(|e| Error::Certificate(format!("invalid private key: {e}")))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| Error::Certificate(format!("failed to create signing key: {e}")))?;

        Ok(rustls::sign::CertifiedKey::new(certs, signing_key))
    }
}

/// Parses a PEM string containing one or more `CERTIFICATE` blocks.
pub fn parse_chain_pem(chain_pem: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|e| Error::Certificate(format!("failed to parse certificate chain: {e}")))?;

    blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| Ok(Certificate::from_der(block.into_contents())))
        .collect()
}

fn timestamp(secs: i64, field: &str) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::Certificate(format!("invalid {field} timestamp")))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair, SanType};

    fn test_leaf_pem(common_name: &str) -> String {
        let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.subject_alt_names = vec![
            SanType::DnsName("alt.example.com".try_into().unwrap()),
            SanType::IpAddress("10.0.0.1".parse().unwrap()),
        ];
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn parses_leaf_metadata() {
        let pem = test_leaf_pem("test.example.com");
        let bundle = CertBundle::from_pem(&pem, PrivateKey::generate_ecdsa()).unwrap();

        let leaf = bundle.leaf();
        assert_eq!(leaf.subject_common_name(), "test.example.com");
        assert!(leaf.dns_names().contains(&"alt.example.com".to_string()));
        assert_eq!(leaf.ip_addresses(), ["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert!(leaf.not_after() > leaf.not_before());
        assert!(!leaf.serial().is_empty());
    }

    #[test]
    fn empty_chain_rejected() {
        assert!(matches!(
            CertBundle::from_pem("", PrivateKey::generate_ecdsa()),
            Err(Error::Certificate(_))
        ));
    }

    #[test]
    fn chain_pem_roundtrip() {
        let pem = test_leaf_pem("roundtrip.example.com");
        let chain = parse_chain_pem(&pem).unwrap();
        assert_eq!(chain.len(), 1);

        let reparsed = parse_chain_pem(chain[0].to_pem()).unwrap();
        assert_eq!(reparsed[0].der(), chain[0].der());
    }

    #[test]
    fn expires_within_checks_window() {
        let pem = test_leaf_pem("expiry.example.com");
        let bundle = CertBundle::from_pem(&pem, PrivateKey::generate_ecdsa()).unwrap();

        // rcgen default validity is far in the future
        assert!(!bundle.expires_within(chrono::Duration::hours(1)));
        assert!(bundle.expires_within(chrono::Duration::days(365 * 100)));
    }
}
