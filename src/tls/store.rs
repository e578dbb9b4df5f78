//! On-disk certificate store with an in-memory TTL cache.
//!
//! Layout under the store folder:
//!
//! ```text
//! <id>.cert   PEM certificate (what the OS trust store is pointed at)
//! <id>.json   CertificateRecord used to rebuild the Certificate
//! serial      last issued serial number, decimal
//! ```
//!
//! Certificate files are only meaningful together with the serial history of
//! the CA that signed them. If the serial file disappears, every stored
//! certificate is purged at open time so a fresh CA never collides with
//! serials it cannot see.

use super::certificate::{Certificate, CertificateRecord};
use super::error::{CertificateError, CertificateResult};
use moka::future::Cache;
use num_bigint::BigUint;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the serial counter file.
pub const SERIAL_FILE: &str = "serial";

/// Serial value assumed when no counter file exists.
pub const INITIAL_SERIAL: &str = "00";

const CERT_EXTENSION: &str = "cert";
const RECORD_EXTENSION: &str = "json";

/// How long a certificate stays in the memory cache.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Maximum number of cached certificates.
pub const CACHE_CAPACITY: u64 = 1000;

/// Persistence and cache layer for issued certificates.
pub struct CertificateStore {
    folder: PathBuf,
    cache: Cache<String, Arc<Certificate>>,
    serial_lock: Mutex<()>,
}

impl CertificateStore {
    /// Open (creating if needed) the store at `folder`.
    ///
    /// Runs the serial dependency check before returning.
    pub async fn open(folder: impl Into<PathBuf>) -> CertificateResult<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)
            .await
            .map_err(|source| CertificateError::WriteFile {
                path: folder.clone(),
                source,
            })?;

        let store = Self {
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            folder,
            serial_lock: Mutex::new(()),
        };
        store.setup_serial_dependency().await?;

        Ok(store)
    }

    /// Folder holding the certificate files.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Path of the PEM certificate file for `id`.
    pub fn certificate_path(&self, id: &str) -> PathBuf {
        self.folder.join(format!("{}.{}", id, CERT_EXTENSION))
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.folder.join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    fn serial_path(&self) -> PathBuf {
        self.folder.join(SERIAL_FILE)
    }

    /// Look up a certificate by id.
    ///
    /// A certificate inside its renewal buffer is deleted and reported as
    /// missing so the caller re-issues it.
    pub async fn find(&self, id: &str) -> CertificateResult<Option<Arc<Certificate>>> {
        validate_id(id)?;

        let certificate = match self.cache.get(id).await {
            Some(certificate) => certificate,
            None => {
                let Some(record) = self.read_record(id).await? else {
                    return Ok(None);
                };
                let certificate = Arc::new(Certificate::restore(record)?);
                self.cache.insert(id.to_string(), certificate.clone()).await;
                certificate
            }
        };

        if certificate.should_renew() {
            info!(id = %id, not_after = %certificate.not_after(), "Stored certificate is expiring, discarding");
            self.delete(id).await?;
            return Ok(None);
        }

        Ok(Some(certificate))
    }

    /// Persist a certificate and refresh its cache entry.
    pub async fn save(&self, certificate: Arc<Certificate>) -> CertificateResult<()> {
        let id = certificate.id().to_string();
        validate_id(&id)?;

        let record = serde_json::to_vec(&certificate.to_record())?;
        write_restricted_file(&self.certificate_path(&id), certificate.pem().as_bytes()).await?;
        write_restricted_file(&self.record_path(&id), &record).await?;

        self.cache.insert(id.clone(), certificate).await;
        debug!(id = %id, "Saved certificate");

        Ok(())
    }

    /// Remove a certificate from disk and cache. Missing files are not an error.
    pub async fn delete(&self, id: &str) -> CertificateResult<()> {
        validate_id(id)?;

        self.cache.invalidate(id).await;
        remove_if_exists(&self.certificate_path(id)).await?;
        remove_if_exists(&self.record_path(id)).await?;
        debug!(id = %id, "Deleted certificate");

        Ok(())
    }

    /// Allocate the next serial number.
    ///
    /// The counter is persisted before the value is handed out.
    pub async fn next_serial_id(&self) -> CertificateResult<String> {
        let _guard = self.serial_lock.lock().await;
        let path = self.serial_path();

        let current = match fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => INITIAL_SERIAL.to_string(),
            Err(source) => return Err(CertificateError::ReadFile { path, source }),
        };

        let current: BigUint = current
            .parse()
            .map_err(|_| CertificateError::InvalidSerial(current.clone()))?;
        let next = (current + 1u32).to_string();

        fs::write(&path, next.as_bytes())
            .await
            .map_err(|source| CertificateError::WriteFile { path, source })?;

        Ok(next)
    }

    /// Ids of every certificate record currently on disk, sorted.
    pub async fn issued_certificate_ids(&self) -> CertificateResult<Vec<String>> {
        let mut ids = Vec::new();
        for path in self.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Purge stored certificates when the serial counter is missing.
    ///
    /// Returns the number of files removed.
    pub async fn setup_serial_dependency(&self) -> CertificateResult<usize> {
        match fs::metadata(self.serial_path()).await {
            Ok(_) => return Ok(0),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CertificateError::ReadFile {
                    path: self.serial_path(),
                    source,
                });
            }
        }

        let mut removed = 0;
        for path in self.list_files().await? {
            let ext = path.extension().and_then(|e| e.to_str());
            if ext == Some(CERT_EXTENSION) || ext == Some(RECORD_EXTENSION) {
                remove_if_exists(&path).await?;
                removed += 1;
            }
        }
        self.cache.invalidate_all();

        if removed > 0 {
            warn!(
                removed,
                folder = %self.folder.display(),
                "Serial file missing, purged stale certificates"
            );
        }

        Ok(removed)
    }

    async fn read_record(&self, id: &str) -> CertificateResult<Option<CertificateRecord>> {
        let path = self.record_path(id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CertificateError::ReadFile { path, source }),
        }
    }

    async fn list_files(&self) -> CertificateResult<Vec<PathBuf>> {
        let read_err = |source| CertificateError::ReadFile {
            path: self.folder.clone(),
            source,
        };
        let mut entries = fs::read_dir(&self.folder).await.map_err(read_err)?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            files.push(entry.path());
        }
        Ok(files)
    }
}

/// Ids become file names, so they must stay inside the store folder.
fn validate_id(id: &str) -> CertificateResult<()> {
    if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
        return Err(CertificateError::Parse(format!(
            "invalid certificate id {:?}",
            id
        )));
    }
    Ok(())
}

/// Write a file with restricted permissions (0600).
async fn write_restricted_file(path: &Path, content: &[u8]) -> CertificateResult<()> {
    let write_err = |source| CertificateError::WriteFile {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
        .map_err(write_err)?;

    file.write_all(content).await.map_err(write_err)?;
    file.flush().await.map_err(write_err)?;

    Ok(())
}

async fn remove_if_exists(path: &Path) -> CertificateResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CertificateError::RemoveFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}
