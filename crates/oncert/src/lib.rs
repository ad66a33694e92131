//! On-demand TLS certificate acquisition, caching and renewal.
//!
//! This crate obtains X.509 certificates at the moment a TLS handshake needs
//! one. A [`CertManager`] hooks into the server and client sides of a
//! handshake, consults a [`Cache`], applies a renewal policy and, when a new
//! certificate is required, generates a key and CSR locally and asks a
//! pluggable [`Issuer`] backend to sign it. Concurrent handshakes for the
//! same identity are collapsed into a single issuance.
//!
//! # Components
//!
//! - [`manager`] - `CertManager`, the handshake-facing orchestrator
//! - [`issuer`] - the `Issuer` trait and the Vault, CFSSL, ACM PCA and
//!   Cloudflare Origin CA backends
//! - [`cache`] - `Cache` trait with in-memory and filesystem implementations
//! - [`keys`] - private key generation (P-256 ECDSA default, RSA optional)
//! - [`csr`] - CSR construction from an identity and certificate config
//! - [`certificate`] - certificate chain and bundle types
//! - [`singleflight`] - per-key request coalescing
//! - [`tls`] - rustls integration helpers
//!
//! # Example
//!
//! ```ignore
//! use oncert::{CertManager, MemoryCache};
//! use oncert::issuer::vault::{ConstantToken, VaultIssuer};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let issuer = VaultIssuer::new(
//!     "https://vault.internal:8200".parse().unwrap(),
//!     "myrole",
//!     Arc::new(ConstantToken::new("s.token")),
//! );
//! let manager = CertManager::new("myservice.internal", Arc::new(issuer))
//!     .with_cache(Arc::new(MemoryCache::new()))
//!     .with_renew_before(Duration::from_secs(30 * 60));
//!
//! // In an async context, at handshake time:
//! let bundle = manager.select_server_certificate("myservice.internal").await?;
//! ```

pub mod cache;
pub mod certificate;
pub mod csr;
pub mod identity;
pub mod issuer;
pub mod keys;
pub mod manager;
pub mod singleflight;
pub mod tls;

pub use cache::{Cache, DirCache, MemoryCache};
pub use certificate::{CertBundle, Certificate, LeafInfo};
pub use identity::Identity;
pub use issuer::{CertConfig, Issuer};
pub use keys::{EcdsaKeyGenerator, KeyGenerator, PrivateKey, RsaKeyGenerator, SingletonKeyGenerator};
pub use manager::CertManager;
pub use tls::{TlsClientConfig, TlsServerConfig};

/// Errors that can occur during certificate acquisition.
///
/// The enum is `Clone` so that every caller joined on a coalesced issuance
/// can receive the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The server name from the handshake is empty or contains invalid
    /// characters.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// A cache read, write or delete failed. A missing entry is not an
    /// error; caches report it as `Ok(None)`.
    #[error("cache error: {0}")]
    Cache(String),

    /// The injected key generator failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// CSR construction or signing failed.
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// Certificate or key material could not be parsed.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The CA rejected our credentials (bad token, missing permissions).
    #[error("issuer authentication failed: {0}")]
    Auth(String),

    /// The CA refused the request (role disallows the name, TTL exceeds the
    /// role maximum, malformed CSR).
    #[error("issuer policy refused request: {0}")]
    Policy(String),

    /// The CA could not be reached. Retryable by the caller; never retried
    /// internally.
    #[error("issuer transport error: {0}")]
    Transport(String),

    /// The CA answered with an unexpected failure.
    #[error("issuer upstream error: {0}")]
    Upstream(String),

    /// The per-call deadline fired before a certificate was obtained.
    #[error("certificate issuance timed out")]
    Timeout,

    /// Unknown algorithm, PEM label or response discriminator.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// TLS handshake plumbing failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for oncert operations.
pub type Result<T> = std::result::Result<T, Error>;
