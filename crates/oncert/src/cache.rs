//! Certificate caches.
//!
//! A cache maps an identity to an issued [`CertBundle`]. A missing entry is
//! an expected outcome and is reported as `Ok(None)`; only real I/O failures
//! are errors. Implementations must be safe under concurrent access across
//! distinct and identical keys.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::certificate::CertBundle;
use crate::keys::PrivateKey;
use crate::{Error, Result};

/// A thread-safe identity-to-certificate store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the cached bundle for `key`, or `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<Arc<CertBundle>>>;

    /// Stores `bundle` under `key`.
    async fn put(&self, key: &str, bundle: Arc<CertBundle>) -> Result<()>;

    /// Removes the entry for `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// An in-process cache backed by a map under a reader/writer lock.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Arc<CertBundle>>>,
}

impl MemoryCache {
    /// Creates a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Arc<CertBundle>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, bundle: Arc<CertBundle>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), bundle);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}

/// A filesystem cache persisting each entry as `<key>.cert` (PEM chain, leaf
/// first) and `<key>.key` (PEM private key).
///
/// Writes go to temporary siblings first and are renamed into place, so a
/// reader never observes a half-written pair. The directory is created with
/// owner-only permissions on first put, and key material is written with
/// owner-only file modes. Filesystem work runs on the blocking pool;
/// cancelling a call abandons the wait but any in-flight syscall completes
/// and its result is discarded.
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    /// Creates a cache rooted at `dir`. The directory is created lazily on
    /// the first `put`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn cert_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.cert"))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.key"))
    }
}

#[async_trait]
impl Cache for DirCache {
    async fn get(&self, key: &str) -> Result<Option<Arc<CertBundle>>> {
        let cert_path = self.cert_path(key);
        let key_path = self.key_path(key);

        let loaded = tokio::task::spawn_blocking(move || load_pair(&cert_path, &key_path))
            .await
            .map_err(|e| Error::Cache(format!("cache read task failed: {e}")))??;

        let Some((chain_pem, key_pem)) = loaded else {
            return Ok(None);
        };

        let private_key = PrivateKey::from_pem(&key_pem)?;
        let bundle = CertBundle::from_pem(&chain_pem, private_key)?;
        Ok(Some(Arc::new(bundle)))
    }

    async fn put(&self, key: &str, bundle: Arc<CertBundle>) -> Result<()> {
        let dir = self.dir.clone();
        let cert_path = self.cert_path(key);
        let key_path = self.key_path(key);
        let chain_pem = bundle.chain_pem();
        let key_pem = bundle.private_key().to_pem()?;

        tokio::task::spawn_blocking(move || {
            store_pair(&dir, &cert_path, &key_path, &chain_pem, &key_pem)
        })
        .await
        .map_err(|e| Error::Cache(format!("cache write task failed: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let cert_path = self.cert_path(key);
        let key_path = self.key_path(key);

        tokio::task::spawn_blocking(move || {
            let cert_res = remove_if_present(&cert_path);
            let key_res = remove_if_present(&key_path);
            cert_res.and(key_res)
        })
        .await
        .map_err(|e| Error::Cache(format!("cache delete task failed: {e}")))?
    }
}

/// Loads the cert/key file pair. A missing file on either side is a miss: a
/// partial pair is treated as no cached entry.
fn load_pair(cert_path: &Path, key_path: &Path) -> Result<Option<(String, String)>> {
    let chain_pem = match std::fs::read_to_string(cert_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Cache(format!("failed to read {cert_path:?}: {e}"))),
    };
    let key_pem = match std::fs::read_to_string(key_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Cache(format!("failed to read {key_path:?}: {e}"))),
    };
    Ok(Some((chain_pem, key_pem)))
}

fn store_pair(
    dir: &Path,
    cert_path: &Path,
    key_path: &Path,
    chain_pem: &str,
    key_pem: &str,
) -> Result<()> {
    create_cache_dir(dir)?;

    match write_pair(dir, cert_path, key_path, chain_pem, key_pem) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Restore the pre-operation state: neither temporaries nor a
            // partially renamed pair may remain for this key.
            let _ = std::fs::remove_file(cert_path);
            let _ = std::fs::remove_file(key_path);
            Err(e)
        }
    }
}

fn write_pair(
    dir: &Path,
    cert_path: &Path,
    key_path: &Path,
    chain_pem: &str,
    key_pem: &str,
) -> Result<()> {
    let cert_tmp = write_temp(dir, chain_pem.as_bytes())?;
    let key_tmp = write_temp(dir, key_pem.as_bytes())?;

    // Dropping a NamedTempFile removes it from disk.
    cert_tmp
        .persist(cert_path)
        .map_err(|e| Error::Cache(format!("failed to rename into {cert_path:?}: {e}")))?;
    key_tmp
        .persist(key_path)
        .map_err(|e| Error::Cache(format!("failed to rename into {key_path:?}: {e}")))?;
    Ok(())
}

/// Writes contents to a new owner-only temporary file inside `dir`.
fn write_temp(dir: &Path, contents: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::Cache(format!("failed to create temporary file in {dir:?}: {e}")))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| Error::Cache(format!("failed to write temporary file: {e}")))?;
    Ok(tmp)
}

fn create_cache_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|e| Error::Cache(format!("failed to create cache dir {dir:?}: {e}")))
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Cache(format!("failed to create cache dir {dir:?}: {e}")))
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(?path, "removed cached certificate file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Cache(format!("failed to remove {path:?}: {e}"))),
    }
}
