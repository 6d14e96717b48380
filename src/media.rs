use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::FileKind;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("temporary file missing: {0}")]
    Missing(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

/// Permanent storage for processed uploads.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Moves `tmp` into permanent storage as `<kind>/<name>` and returns its public path.
    async fn promote(&self, tmp: &Path, kind: FileKind, name: &str, mime: &str) -> Result<String, MediaError>;
    async fn delete(&self, kind: FileKind, name: &str) -> Result<(), MediaError>;
}

pub struct FsMediaStore {
    root: PathBuf,
    url_prefix: String,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self { root: root.into(), url_prefix: url_prefix.into() }
    }

    fn dest(&self, kind: FileKind, name: &str) -> PathBuf {
        self.root.join(kind.as_str()).join(name)
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn promote(&self, tmp: &Path, kind: FileKind, name: &str, _mime: &str) -> Result<String, MediaError> {
        if !tokio::fs::try_exists(tmp).await.unwrap_or(false) {
            return Err(MediaError::Missing(tmp.display().to_string()));
        }
        let dest = self.dest(kind, name);
        if let Some(dir) = dest.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // rename fails across filesystems
        if tokio::fs::rename(tmp, &dest).await.is_err() {
            tokio::fs::copy(tmp, &dest).await?;
            tokio::fs::remove_file(tmp).await?;
        }
        Ok(format!("{}/{}/{}", self.url_prefix.trim_end_matches('/'), kind.as_str(), name))
    }

    async fn delete(&self, kind: FileKind, name: &str) -> Result<(), MediaError> {
        match tokio::fs::remove_file(self.dest(kind, name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(feature = "s3-media")]
pub mod s3 {
    use super::*;

    /// S3 / MinIO backed media store.
    pub struct S3MediaStore {
        bucket: String,
        client: aws_sdk_s3::Client,
        public_url: String,
    }

    impl S3MediaStore {
        pub async fn from_env() -> anyhow::Result<Self> {
            use aws_credential_types::provider::SharedCredentialsProvider;
            use aws_credential_types::Credentials;

            let bucket = std::env::var("S3_BUCKET").unwrap_or_else(|_| "rib-media".into());
            let endpoint = std::env::var("S3_ENDPOINT")
                .map_err(|_| anyhow::anyhow!("S3_ENDPOINT must be set (MinIO / S3 endpoint)"))?;
            let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".into());
            let access = std::env::var("S3_ACCESS_KEY").unwrap_or_default();
            let secret = std::env::var("S3_SECRET_KEY").unwrap_or_default();
            let public_url = std::env::var("S3_PUBLIC_URL")
                .unwrap_or_else(|_| format!("{}/{}", endpoint.trim_end_matches('/'), bucket));

            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(aws_sdk_s3::config::Region::new(region))
                .endpoint_url(endpoint);
            if !access.is_empty() && !secret.is_empty() {
                let creds = Credentials::new(access, secret, None, None, "static");
                loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
            }
            let conf = loader.load().await;
            // MinIO without wildcard DNS needs path-style addressing
            let s3_conf = aws_sdk_s3::config::Builder::from(&conf).force_path_style(true).build();
            let client = aws_sdk_s3::Client::from_conf(s3_conf);
            info!(bucket = %bucket, "initialised S3 media client");

            if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
                warn!(bucket = %bucket, error = ?e, "head_bucket failed, creating");
                let max_attempts = 8u32;
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match client.create_bucket().bucket(&bucket).send().await {
                        Ok(_) => break,
                        Err(e) if attempt >= max_attempts => {
                            return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e}"));
                        }
                        Err(e) => {
                            let backoff_ms = 200 * attempt.pow(2);
                            warn!(attempt, backoff_ms, error = ?e, "create_bucket failed, retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64)).await;
                        }
                    }
                }
            }

            Ok(Self { bucket, client, public_url })
        }

        fn key_for(kind: FileKind, name: &str) -> String {
            format!("{}/{}", kind.as_str(), name)
        }
    }

    #[async_trait]
    impl MediaStore for S3MediaStore {
        async fn promote(&self, tmp: &Path, kind: FileKind, name: &str, mime: &str) -> Result<String, MediaError> {
            use aws_sdk_s3::primitives::ByteStream;
            let bytes = match tokio::fs::read(tmp).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(MediaError::Missing(tmp.display().to_string()))
                }
                Err(e) => return Err(e.into()),
            };
            let key = Self::key_for(kind, name);
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_type(mime)
                .body(ByteStream::from(bytes))
                .send()
                .await
                .map_err(|e| MediaError::Other(e.to_string()))?;
            let _ = tokio::fs::remove_file(tmp).await;
            Ok(format!("{}/{}", self.public_url.trim_end_matches('/'), key))
        }

        async fn delete(&self, kind: FileKind, name: &str) -> Result<(), MediaError> {
            // missing objects count as deleted
            let _ = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(Self::key_for(kind, name))
                .send()
                .await;
            Ok(())
        }
    }
}

/// Filesystem store unless `RIB_MEDIA_BACKEND=s3` and the `s3-media` feature is on.
pub async fn build_media_store(cfg: &Config) -> anyhow::Result<Arc<dyn MediaStore>> {
    let backend = std::env::var("RIB_MEDIA_BACKEND").unwrap_or_default();
    #[cfg(feature = "s3-media")]
    if backend == "s3" {
        return Ok(Arc::new(s3::S3MediaStore::from_env().await?));
    }
    if backend == "s3" {
        warn!("RIB_MEDIA_BACKEND=s3 requested but built without s3-media; using filesystem");
    }
    info!(dir = %cfg.media_dir.display(), "using filesystem media store");
    Ok(Arc::new(FsMediaStore::new(cfg.media_dir.clone(), cfg.media_url.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn promote_moves_file_and_returns_public_path() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("upload.tmp");
        std::fs::write(&tmp, b"png").unwrap();
        let store = FsMediaStore::new(dir.path().join("media"), "/media/");
        let url = store.promote(&tmp, FileKind::Thumb, "abc.jpg", "image/jpeg").await.unwrap();
        assert_eq!(url, "/media/thumb/abc.jpg");
        assert!(!tmp.exists());
        assert!(dir.path().join("media/thumb/abc.jpg").exists());

        let again = store.promote(&tmp, FileKind::Thumb, "abc.jpg", "image/jpeg").await;
        assert!(matches!(again, Err(MediaError::Missing(_))));
        store.delete(FileKind::Thumb, "abc.jpg").await.unwrap();
        store.delete(FileKind::Thumb, "abc.jpg").await.unwrap();
    }
}
