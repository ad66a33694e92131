//! Certificate Signing Request construction.
//!
//! Builds a PKCS#10 CSR from a common name and a [`CertConfig`]: the subject
//! CN is the common name, and the configured DNS, IP and URI SANs are carried
//! into the request. The private key comes from the config's key generator
//! (fresh P-256 when none is set) and is returned alongside the CSR.

use rcgen::{CertificateParams, DistinguishedName, DnType, SanType};

use crate::issuer::CertConfig;
use crate::keys::{EcdsaKeyGenerator, KeyGenerator, PrivateKey};
use crate::{Error, Result};

/// A PEM-encoded CSR and the private key it was signed with.
#[derive(Debug, Clone)]
pub struct CertRequest {
    csr_pem: String,
    private_key: PrivateKey,
}

impl CertRequest {
    /// Returns the PEM-encoded CSR (`CERTIFICATE REQUEST` block).
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Returns the private key matching the CSR's public key.
    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Consumes the request, returning CSR PEM and key.
    pub fn into_parts(self) -> (String, PrivateKey) {
        (self.csr_pem, self.private_key)
    }
}

/// Builds a CSR for the given common name from the certificate config.
pub fn from_cert_config(common_name: &str, conf: &CertConfig) -> Result<CertRequest> {
    let private_key = match &conf.key_generator {
        Some(generator) => generator.generate()?,
        None => EcdsaKeyGenerator.generate()?,
    };

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| Error::CsrGeneration(format!("failed to create params: {e}")))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    for dns in &conf.dns_sans {
        let name = dns
            .clone()
            .try_into()
            .map_err(|e| Error::CsrGeneration(format!("invalid DNS name {dns:?}: {e}")))?;
        params.subject_alt_names.push(SanType::DnsName(name));
    }
    for ip in &conf.ip_sans {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }
    for uri in &conf.uri_sans {
        let name = rcgen::string::Ia5String::try_from(uri.clone())
            .map_err(|e| Error::CsrGeneration(format!("invalid URI SAN {uri:?}: {e}")))?;
        params.subject_alt_names.push(SanType::URI(name));
    }

    let key_pair = private_key.signing_key_pair()?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| Error::CsrGeneration(format!("CSR signing failed: {e}")))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| Error::CsrGeneration(format!("CSR PEM encoding failed: {e}")))?;

    Ok(CertRequest {
        csr_pem,
        private_key,
    })
}
