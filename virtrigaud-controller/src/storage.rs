//! Storage URL scheme for migration payloads and the streaming transport
//! helper used when export and import sides cannot share a location.
//!
//! The controller owns the URL scheme; providers own staging and format
//! conversion. `pvc://<name>/<path>` resolves inside a provider pod to
//! `/mnt/migration-storage/<name>/<path>`; the controller resolves the
//! same URL against its configured mount root when it has to copy
//! payloads itself.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use virtrigaud_api::migration::StorageBackendType;

/// Mount path of migration PVCs inside provider pods.
pub const PROVIDER_MOUNT_ROOT: &str = "/mnt/migration-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("malformed storage url {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http transport error: {0}")]
    Http(String),

    #[error("s3 transport error: {0}")]
    S3(String),

    #[error("transport between {0} and {1} is not supported")]
    Unsupported(String, String),
}

/// A parsed migration payload location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUrl {
    /// `pvc://<pvc-name>/<path>`
    Pvc { pvc: String, path: String },
    /// `s3://<bucket>/<key>`
    S3 { bucket: String, key: String },
    /// `http://` / `https://`: PUT on export, GET on import
    Http { url: String },
    /// `nfs://<host>/<export>/<path>`
    Nfs { host: String, path: String },
}

impl StorageUrl {
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let malformed = |reason: &str| StorageError::Parse {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = url.strip_prefix("pvc://") {
            let (pvc, path) = rest
                .split_once('/')
                .ok_or_else(|| malformed("expected pvc://<name>/<path>"))?;
            if pvc.is_empty() || path.is_empty() {
                return Err(malformed("expected pvc://<name>/<path>"));
            }
            return Ok(StorageUrl::Pvc {
                pvc: pvc.to_string(),
                path: path.to_string(),
            });
        }
        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, key) = rest
                .split_once('/')
                .ok_or_else(|| malformed("expected s3://<bucket>/<key>"))?;
            if bucket.is_empty() || key.is_empty() {
                return Err(malformed("expected s3://<bucket>/<key>"));
            }
            return Ok(StorageUrl::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(StorageUrl::Http {
                url: url.to_string(),
            });
        }
        if let Some(rest) = url.strip_prefix("nfs://") {
            let (host, path) = rest
                .split_once('/')
                .ok_or_else(|| malformed("expected nfs://<host>/<path>"))?;
            if host.is_empty() || path.is_empty() {
                return Err(malformed("expected nfs://<host>/<path>"));
            }
            return Ok(StorageUrl::Nfs {
                host: host.to_string(),
                path: path.to_string(),
            });
        }
        Err(malformed("unknown scheme"))
    }

    /// Render back to the canonical URL string.
    pub fn to_url(&self) -> String {
        match self {
            StorageUrl::Pvc { pvc, path } => format!("pvc://{}/{}", pvc, path),
            StorageUrl::S3 { bucket, key } => format!("s3://{}/{}", bucket, key),
            StorageUrl::Http { url } => url.clone(),
            StorageUrl::Nfs { host, path } => format!("nfs://{}/{}", host, path),
        }
    }

    /// Which backend family the URL belongs to.
    pub fn backend(&self) -> StorageBackendType {
        match self {
            StorageUrl::Pvc { .. } => StorageBackendType::Pvc,
            StorageUrl::S3 { .. } => StorageBackendType::S3,
            StorageUrl::Http { .. } => StorageBackendType::Http,
            StorageUrl::Nfs { .. } => StorageBackendType::Nfs,
        }
    }

    /// Path a provider pod sees for this URL, when file-backed.
    pub fn pod_path(&self) -> Option<PathBuf> {
        match self {
            StorageUrl::Pvc { pvc, path } => {
                Some(Path::new(PROVIDER_MOUNT_ROOT).join(pvc).join(path))
            }
            _ => None,
        }
    }

    /// Resolve against a local mount root (the controller's own view of
    /// PVC and NFS mounts).
    pub fn local_path(&self, mount_root: &Path) -> Option<PathBuf> {
        match self {
            StorageUrl::Pvc { pvc, path } => Some(mount_root.join(pvc).join(path)),
            StorageUrl::Nfs { host, path } => Some(mount_root.join(host).join(path)),
            _ => None,
        }
    }
}

/// Whether both URLs land on the same backend location family, making the
/// transport phase a no-op.
pub fn same_backend(a: &StorageUrl, b: &StorageUrl) -> bool {
    match (a, b) {
        (StorageUrl::Pvc { pvc: p1, .. }, StorageUrl::Pvc { pvc: p2, .. }) => p1 == p2,
        (StorageUrl::S3 { bucket: b1, .. }, StorageUrl::S3 { bucket: b2, .. }) => b1 == b2,
        (StorageUrl::Http { .. }, StorageUrl::Http { .. }) => true,
        (StorageUrl::Nfs { host: h1, .. }, StorageUrl::Nfs { host: h2, .. }) => h1 == h2,
        _ => false,
    }
}

/// Transport configuration for cross-backend copies.
pub struct Transport {
    mount_root: PathBuf,
    http: reqwest::Client,
    s3: tokio::sync::OnceCell<aws_sdk_s3::Client>,
}

impl Transport {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        Self {
            mount_root: mount_root.into(),
            http: reqwest::Client::new(),
            s3: tokio::sync::OnceCell::new(),
        }
    }

    async fn s3_client(&self) -> &aws_sdk_s3::Client {
        self.s3
            .get_or_init(|| async {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }

    /// Copy a payload between backends. Returns bytes copied.
    ///
    /// Only needed when the export destination and import source differ;
    /// same-backend migrations skip the transport phase entirely.
    pub async fn copy(&self, src: &StorageUrl, dst: &StorageUrl) -> Result<u64, StorageError> {
        debug!(src = %src.to_url(), dst = %dst.to_url(), "Transporting migration payload");
        let data = self.read(src).await?;
        let len = data.len() as u64;
        self.write(dst, data).await?;
        info!(src = %src.to_url(), dst = %dst.to_url(), bytes = len, "Payload transported");
        Ok(len)
    }

    async fn read(&self, src: &StorageUrl) -> Result<Vec<u8>, StorageError> {
        if let Some(path) = src.local_path(&self.mount_root) {
            return tokio::fs::read(&path).await.map_err(|e| StorageError::Io {
                path: path.display().to_string(),
                source: e,
            });
        }
        match src {
            StorageUrl::Http { url } => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| StorageError::Http(e.to_string()))?;
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| StorageError::Http(e.to_string()))?;
                Ok(body.to_vec())
            }
            StorageUrl::S3 { bucket, key } => {
                let object = self
                    .s3_client()
                    .await
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| StorageError::S3(e.to_string()))?;
                let body = object
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::S3(e.to_string()))?;
                Ok(body.into_bytes().to_vec())
            }
            other => Err(StorageError::Unsupported(
                other.to_url(),
                "local read".to_string(),
            )),
        }
    }

    async fn write(&self, dst: &StorageUrl, data: Vec<u8>) -> Result<(), StorageError> {
        if let Some(path) = dst.local_path(&self.mount_root) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Io {
                        path: parent.display().to_string(),
                        source: e,
                    })?;
            }
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| StorageError::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
            file.write_all(&data).await.map_err(|e| StorageError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
            return Ok(());
        }
        match dst {
            StorageUrl::Http { url } => {
                self.http
                    .put(url)
                    .body(data)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| StorageError::Http(e.to_string()))?;
                Ok(())
            }
            StorageUrl::S3 { bucket, key } => {
                self.s3_client()
                    .await
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(aws_sdk_s3::primitives::ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| StorageError::S3(e.to_string()))?;
                Ok(())
            }
            other => Err(StorageError::Unsupported(
                "local write".to_string(),
                other.to_url(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let cases = [
            "pvc://mig-1-storage/export.qcow2",
            "s3://backups/mig-1/export.qcow2",
            "https://staging.example.com/mig-1/export.qcow2",
            "nfs://filer-1/exports/mig-1/export.qcow2",
        ];
        for url in cases {
            let parsed = StorageUrl::parse(url).unwrap();
            assert_eq!(parsed.to_url(), url);
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(StorageUrl::parse("pvc://no-path").is_err());
        assert!(StorageUrl::parse("s3://bucket-only").is_err());
        assert!(StorageUrl::parse("ftp://host/file").is_err());
        assert!(StorageUrl::parse("").is_err());
    }

    #[test]
    fn test_pod_path_resolution() {
        let url = StorageUrl::parse("pvc://mig-1-storage/export.qcow2").unwrap();
        assert_eq!(
            url.pod_path().unwrap(),
            Path::new("/mnt/migration-storage/mig-1-storage/export.qcow2")
        );
        assert!(StorageUrl::parse("s3://b/k").unwrap().pod_path().is_none());
    }

    #[test]
    fn test_same_backend() {
        let a = StorageUrl::parse("pvc://mig-1/export.qcow2").unwrap();
        let b = StorageUrl::parse("pvc://mig-1/import.qcow2").unwrap();
        let c = StorageUrl::parse("pvc://other/export.qcow2").unwrap();
        let d = StorageUrl::parse("s3://bucket/key").unwrap();
        assert!(same_backend(&a, &b));
        assert!(!same_backend(&a, &c));
        assert!(!same_backend(&a, &d));
    }

    #[tokio::test]
    async fn test_file_backed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Transport::new(dir.path());

        let src = StorageUrl::parse("pvc://src-pvc/export.qcow2").unwrap();
        let dst = StorageUrl::parse("pvc://dst-pvc/import.qcow2").unwrap();

        let src_path = src.local_path(dir.path()).unwrap();
        std::fs::create_dir_all(src_path.parent().unwrap()).unwrap();
        std::fs::write(&src_path, b"disk payload").unwrap();

        let copied = transport.copy(&src, &dst).await.unwrap();
        assert_eq!(copied, 12);

        let dst_path = dst.local_path(dir.path()).unwrap();
        assert_eq!(std::fs::read(&dst_path).unwrap(), b"disk payload");
    }
}
