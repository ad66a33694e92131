//! Identity derivation from handshake server names.
//!
//! The identity is the normalized name a certificate is requested for. It is
//! used both as the cache key and as the principal SAN of the issued
//! certificate. Server-side it is derived from the SNI value of the client
//! hello; client-side it is the configured common name.

use std::fmt;
use std::net::IpAddr;

use crate::{Error, Result};

/// A normalized certificate identity: a lower-cased DNS name or a textual IP
/// address, with any trailing dot and `:port` suffix removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Derives an identity from the server name supplied by a TLS client
    /// hello.
    ///
    /// Normalization: ASCII lower-case, reject empty names and names
    /// containing `/` or `\`, strip a single trailing `.`, and keep only the
    /// portion before the first `:`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidServerName`] if the name is empty (before or
    /// after normalization) or contains a path separator.
    pub fn from_server_name(server_name: &str) -> Result<Self> {
        let name = server_name.to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::InvalidServerName("missing server name".to_string()));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(Error::InvalidServerName(format!(
                "server name {name:?} contains invalid character"
            )));
        }

        let name = name.strip_suffix('.').unwrap_or(&name);
        let name = match name.split_once(':') {
            Some((host, _port)) => host,
            None => name,
        };

        if name.is_empty() {
            return Err(Error::InvalidServerName(format!(
                "server name {server_name:?} is empty after normalization"
            )));
        }

        Ok(Self(name.to_string()))
    }

    /// Wraps a configured common name without normalization. Used by the
    /// client-side handshake hook, where the identity is chosen by the
    /// operator rather than the peer.
    pub fn from_common_name(common_name: &str) -> Self {
        Self(common_name.to_string())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identity parsed as an IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
