//! AWS Certificate Manager Private CA backend.
//!
//! On first use the CA certificate is fetched once and its signature
//! algorithm mapped to the ACM PCA signing algorithm used for every
//! issuance; both are cached for the life of the issuer and an unsupported
//! algorithm is a sticky error. Issuance is asynchronous on the AWS side:
//! the certificate is requested, polled until issued (up to one minute),
//! then fetched.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_acmpca::error::ProvideErrorMetadata;
use aws_sdk_acmpca::primitives::Blob;
use aws_sdk_acmpca::types::{SigningAlgorithm, Validity, ValidityPeriodType};
use tracing::debug;
use x509_parser::oid_registry::{
    OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA384WITHRSA, OID_PKCS1_SHA512WITHRSA,
    OID_SIG_ECDSA_WITH_SHA256, OID_SIG_ECDSA_WITH_SHA384, OID_SIG_ECDSA_WITH_SHA512,
};
use x509_parser::prelude::parse_x509_certificate;

use crate::certificate::CertBundle;
use crate::csr;
use crate::issuer::{CertConfig, Issuer};
use crate::{Error, Result};

/// How long to wait for AWS to finish issuing a certificate.
const ISSUE_WAIT: Duration = Duration::from_secs(60);
/// Poll interval while waiting for issuance.
const ISSUE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Issues certificates from an AWS ACM Private CA.
pub struct AcmPcaIssuer {
    client: aws_sdk_acmpca::Client,
    ca_arn: String,
    ttl_days: Option<i64>,
    init: tokio::sync::OnceCell<std::result::Result<SigningAlgorithm, Error>>,
}

impl AcmPcaIssuer {
    /// Creates an issuer against the private CA identified by `ca_arn`,
    /// using a pre-configured ACM PCA client.
    pub fn new(client: aws_sdk_acmpca::Client, ca_arn: impl Into<String>) -> Self {
        Self {
            client,
            ca_arn: ca_arn.into(),
            ttl_days: None,
            init: tokio::sync::OnceCell::new(),
        }
    }

    /// Creates an issuer from ambient AWS configuration (environment,
    /// profile, instance metadata).
    pub async fn from_env(ca_arn: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_acmpca::Client::new(&config), ca_arn)
    }

    /// Requests the given certificate lifetime in days. Defaults to 30.
    pub fn with_ttl_days(mut self, days: i64) -> Self {
        self.ttl_days = Some(days);
        self
    }

    /// Fetches the CA certificate and derives the signing algorithm, once
    /// per issuer. The outcome, success or failure, is sticky.
    async fn signing_algorithm(&self) -> Result<SigningAlgorithm> {
        self.init
            .get_or_init(|| async {
                let response = self
                    .client
                    .get_certificate_authority_certificate()
                    .certificate_authority_arn(&self.ca_arn)
                    .send()
                    .await
                    .map_err(|e| classify_sdk_error("GetCertificateAuthorityCertificate", &e))?;

                let ca_pem = response
                    .certificate()
                    .ok_or_else(|| Error::Upstream("CA response carried no certificate".to_string()))?;
                let algorithm = derive_signing_algorithm(ca_pem)?;
                debug!(?algorithm, "derived ACM PCA signing algorithm");
                Ok(algorithm)
            })
            .await
            .clone()
    }

    async fn wait_until_issued(&self, certificate_arn: &str) -> Result<(String, String)> {
        let deadline = tokio::time::Instant::now() + ISSUE_WAIT;
        loop {
            let result = self
                .client
                .get_certificate()
                .certificate_authority_arn(&self.ca_arn)
                .certificate_arn(certificate_arn)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let certificate = response.certificate().ok_or_else(|| {
                        Error::Upstream("GetCertificate returned no certificate".to_string())
                    })?;
                    let chain = response.certificate_chain().ok_or_else(|| {
                        Error::Upstream("GetCertificate returned no chain".to_string())
                    })?;
                    return Ok((certificate.to_string(), chain.to_string()));
                }
                Err(e) if is_request_in_progress(&e) => {
                    if tokio::time::Instant::now() + ISSUE_POLL_INTERVAL > deadline {
                        return Err(Error::Timeout);
                    }
                    tokio::time::sleep(ISSUE_POLL_INTERVAL).await;
                }
                Err(e) => return Err(classify_sdk_error("GetCertificate", &e)),
            }
        }
    }
}

#[async_trait]
impl Issuer for AcmPcaIssuer {
    async fn issue(&self, common_name: &str, conf: &CertConfig) -> Result<CertBundle> {
        let algorithm = self.signing_algorithm().await?;
        let request = csr::from_cert_config(common_name, conf)?;

        let validity = Validity::builder()
            .r#type(ValidityPeriodType::Days)
            .value(self.ttl_days.unwrap_or(30))
            .build()
            .map_err(|e| Error::Internal(format!("invalid validity: {e}")))?;

        let issued = self
            .client
            .issue_certificate()
            .certificate_authority_arn(&self.ca_arn)
            .csr(Blob::new(request.csr_pem().as_bytes()))
            .signing_algorithm(algorithm)
            .validity(validity)
            .send()
            .await
            .map_err(|e| classify_sdk_error("IssueCertificate", &e))?;

        let certificate_arn = issued
            .certificate_arn()
            .ok_or_else(|| Error::Upstream("IssueCertificate returned no ARN".to_string()))?;

        let (certificate, chain) = self.wait_until_issued(certificate_arn).await?;

        let chain_pem = format!("{certificate}\n{chain}");
        let (_, private_key) = request.into_parts();
        CertBundle::from_pem(&chain_pem, private_key)
    }
}

/// Maps the CA certificate's signature algorithm onto the signing
/// algorithms ACM PCA accepts.
fn derive_signing_algorithm(ca_pem: &str) -> Result<SigningAlgorithm> {
    let block = pem::parse(ca_pem)
        .map_err(|e| Error::Certificate(format!("could not parse AWS CA cert PEM: {e}")))?;
    if block.tag() != "CERTIFICATE" {
        return Err(Error::Unsupported(format!(
            "unexpected PEM label in AWS CA cert: {}",
            block.tag()
        )));
    }

    let der = block.into_contents();
    let (_, cert) = parse_x509_certificate(&der)
        .map_err(|e| Error::Certificate(format!("could not parse AWS CA cert: {e}")))?;

    let oid = &cert.signature_algorithm.algorithm;
    if *oid == OID_PKCS1_SHA256WITHRSA {
        Ok(SigningAlgorithm::Sha256Withrsa)
    } else if *oid == OID_PKCS1_SHA384WITHRSA {
        Ok(SigningAlgorithm::Sha384Withrsa)
    } else if *oid == OID_PKCS1_SHA512WITHRSA {
        Ok(SigningAlgorithm::Sha512Withrsa)
    } else if *oid == OID_SIG_ECDSA_WITH_SHA256 {
        Ok(SigningAlgorithm::Sha256Withecdsa)
    } else if *oid == OID_SIG_ECDSA_WITH_SHA384 {
        Ok(SigningAlgorithm::Sha384Withecdsa)
    } else if *oid == OID_SIG_ECDSA_WITH_SHA512 {
        Ok(SigningAlgorithm::Sha512Withecdsa)
    } else {
        Err(Error::Unsupported(format!(
            "unsupported CA cert signing algorithm: {oid}"
        )))
    }
}

fn is_request_in_progress<E, R>(error: &aws_sdk_acmpca::error::SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    error
        .code()
        .is_some_and(|code| code == "RequestInProgressException")
}

fn classify_sdk_error<E, R>(operation: &str, error: &aws_sdk_acmpca::error::SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata,
{
    let detail = error
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{operation} failed"));

    match error.code() {
        Some("AccessDeniedException") | Some("UnrecognizedClientException")
        | Some("InvalidSignatureException") => Error::Auth(detail),
        Some("ValidationException") | Some("MalformedCSRException")
        | Some("InvalidArgsException") | Some("InvalidArnException")
        | Some("InvalidStateException") => Error::Policy(detail),
        Some(code) => Error::Upstream(format!("{operation}: {code}: {detail}")),
        None => Error::Transport(format!("{operation}: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn self_signed_pem(alg: &'static rcgen::SignatureAlgorithm) -> String {
        let key = KeyPair::generate_for(alg).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "test ca");
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn ecdsa_p256_maps_to_sha256_withecdsa() {
        let pem = self_signed_pem(&rcgen::PKCS_ECDSA_P256_SHA256);
        assert_eq!(
            derive_signing_algorithm(&pem).unwrap(),
            SigningAlgorithm::Sha256Withecdsa
        );
    }

    #[test]
    fn ecdsa_p384_maps_to_sha384_withecdsa() {
        let pem = self_signed_pem(&rcgen::PKCS_ECDSA_P384_SHA384);
        assert_eq!(
            derive_signing_algorithm(&pem).unwrap(),
            SigningAlgorithm::Sha384Withecdsa
        );
    }

    #[test]
    fn ed25519_is_unsupported() {
        let pem = self_signed_pem(&rcgen::PKCS_ED25519);
        assert!(matches!(
            derive_signing_algorithm(&pem),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        assert!(derive_signing_algorithm("not a certificate").is_err());
    }
}
