//! Shared test fixtures: an in-process CA that signs real CSRs, standing in
//! for the network backends.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{CertificateParams, CertificateSigningRequestParams, DnType, KeyPair};
use time::OffsetDateTime;
use tokio::sync::watch;

use oncert::issuer::{CertConfig, Issuer};
use oncert::{CertBundle, Error, Result};

/// An in-process CA implementing the issuer contract against real rcgen
/// signing, with hooks for concurrency and failure-injection tests.
pub struct TestCa {
    issuer: rcgen::Issuer<'static, KeyPair>,
    root_pem: String,
    validity: Duration,
    calls: AtomicUsize,
    gate: Option<watch::Receiver<bool>>,
    fail_with: Mutex<Option<Error>>,
    last_config: Mutex<Option<CertConfig>>,
}

impl TestCa {
    /// Creates a CA whose issued leaves are valid for `validity`.
    pub fn new(validity: Duration) -> Self {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "oncert test root");
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let root_cert = params.clone().self_signed(&root_key).unwrap();
        let root_pem = root_cert.pem();

        Self {
            issuer: rcgen::Issuer::new(params, root_key),
            root_pem,
            validity,
            calls: AtomicUsize::new(0),
            gate: None,
            fail_with: Mutex::new(None),
            last_config: Mutex::new(None),
        }
    }

    /// Blocks every issuance until the gate receiver reads `true`.
    pub fn with_gate(mut self, gate: watch::Receiver<bool>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Makes every issuance fail with the given error.
    pub fn with_failure(self, error: Error) -> Self {
        *self.fail_with.lock().unwrap() = Some(error);
        self
    }

    /// Number of completed issue calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The PEM root certificate.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// The cert config the most recent issuance saw.
    pub fn last_config(&self) -> Option<CertConfig> {
        self.last_config.lock().unwrap().clone()
    }

    /// Signs a PEM CSR, returning the leaf PEM. Used directly by the HTTP
    /// backend mocks.
    pub fn sign_csr_pem(&self, csr_pem: &str) -> Result<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::Internal(format!("mock CA could not parse CSR: {e}")))?;

        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now + time::Duration::seconds(self.validity.as_secs() as i64);

        let leaf = csr
            .signed_by(&self.issuer)
            .map_err(|e| Error::Internal(format!("mock CA could not sign CSR: {e}")))?;
        Ok(leaf.pem())
    }
}

#[async_trait]
impl Issuer for TestCa {
    async fn issue(&self, common_name: &str, conf: &CertConfig) -> Result<CertBundle> {
        *self.last_config.lock().unwrap() = Some(conf.clone());

        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }

        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }

        let request = oncert::csr::from_cert_config(common_name, conf)?;
        let leaf_pem = self.sign_csr_pem(request.csr_pem())?;
        let chain_pem = format!("{leaf_pem}\n{}", self.root_pem);
        let (_, private_key) = request.into_parts();
        CertBundle::from_pem(&chain_pem, private_key)
    }
}
