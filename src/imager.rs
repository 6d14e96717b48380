//! Hand-off of processed uploads from the external image pipeline to posts.
//!
//! The pipeline deposits an [`ImageDescriptor`] under a random token. A post
//! redeems the token exactly once: a test-and-set lock guards the descriptor,
//! and the lock outlives the descriptor so a second redeem sees "image in use"
//! until the allocation expires.

use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::media::{MediaError, MediaStore};
use crate::models::{FileKind, Image, ImageDescriptor, PostId, ThumbClass};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("image in use")]
    InUse,
    #[error("image lost")]
    Lost,
    #[error("invalid allocation")]
    Invalid,
    #[error("wrong thumbnail size")]
    WrongSize,
    #[error("image name too long")]
    NameTooLong,
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("media: {0}")]
    Media(#[from] MediaError),
}

pub struct ImageAllocator {
    store: Arc<dyn Store>,
    media: Arc<dyn MediaStore>,
    expiry: Duration,
    duplicate_window: Duration,
    max_name_len: usize,
}

impl ImageAllocator {
    pub fn new(
        store: Arc<dyn Store>,
        media: Arc<dyn MediaStore>,
        expiry: Duration,
        duplicate_window: Duration,
        max_name_len: usize,
    ) -> Self {
        Self { store, media, expiry, duplicate_window, max_name_len }
    }

    fn expires_in(d: Duration) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Stores a descriptor from the image pipeline and returns its token.
    pub async fn deposit(&self, desc: ImageDescriptor) -> Result<String, AllocError> {
        self.validate(&desc)?;
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.store
            .put_allocation(&token, &desc, Self::expires_in(self.expiry))
            .await?;
        debug!(token = %token, hash = %desc.hash, "image allocation deposited");
        Ok(token)
    }

    /// Hands the allocation to one caller. Returns the client-facing image and its content hash.
    pub async fn redeem(&self, token: &str, slot: ThumbClass) -> Result<(Image, String), AllocError> {
        let now = Utc::now();
        if !self.store.lock_allocation(token, now, Self::expires_in(self.expiry)).await? {
            return Err(AllocError::InUse);
        }
        match self.claim(token, slot).await {
            Ok(out) => Ok(out),
            Err(e) => {
                if let Err(unlock) = self.store.unlock_allocation(token).await {
                    warn!(token, error = %unlock, "failed to release image lock");
                }
                Err(e)
            }
        }
    }

    async fn claim(&self, token: &str, slot: ThumbClass) -> Result<(Image, String), AllocError> {
        let desc = self
            .store
            .get_allocation(token, Utc::now())
            .await?
            .ok_or(AllocError::Lost)?;
        self.validate(&desc)?;
        if desc.class != slot {
            return Err(AllocError::WrongSize);
        }

        let mut image = Image {
            name: desc.name.clone(),
            mime: desc.mime.clone(),
            size: desc.size,
            dims: desc.dims,
            src: String::new(),
            thumb: String::new(),
            mid: None,
            spoiler: false,
        };
        for file in &desc.files {
            let url = self
                .media
                .promote(Path::new(&file.tmp), file.kind, &file.name, &desc.mime)
                .await?;
            match file.kind {
                FileKind::Src => image.src = url,
                FileKind::Thumb => image.thumb = url,
                FileKind::Mid => image.mid = Some(url),
            }
        }
        self.store.consume_allocation(token).await?;
        metrics::counter!("rib_images_redeemed_total").increment(1);
        Ok((image, desc.hash))
    }

    /// Records a redeemed hash for the pipeline's duplicate check.
    pub async fn note_hash(&self, hash: &str, post: PostId) -> Result<(), AllocError> {
        self.store
            .note_hash(hash, post, Self::expires_in(self.duplicate_window))
            .await?;
        Ok(())
    }

    /// Post that recently used an image with this hash.
    pub async fn check_duplicate(&self, hash: &str) -> Result<Option<PostId>, AllocError> {
        Ok(self.store.find_hash(hash, Utc::now()).await?)
    }

    pub async fn sweep(&self) -> Result<usize, AllocError> {
        Ok(self.store.sweep_allocations(Utc::now()).await?)
    }

    fn validate(&self, desc: &ImageDescriptor) -> Result<(), AllocError> {
        if desc.name.chars().count() > self.max_name_len {
            return Err(AllocError::NameTooLong);
        }
        if desc.hash.is_empty() || desc.mime.is_empty() || desc.files.is_empty() {
            return Err(AllocError::Invalid);
        }
        let mut kinds = HashSet::new();
        for file in &desc.files {
            if !kinds.insert(file.kind) || !is_safe_name(&file.name) || !is_safe_tmp(&file.tmp) {
                return Err(AllocError::Invalid);
            }
        }
        if !kinds.contains(&FileKind::Src) || !kinds.contains(&FileKind::Thumb) {
            return Err(AllocError::Invalid);
        }
        Ok(())
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && !name.contains("..")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_safe_tmp(tmp: &str) -> bool {
    !tmp.is_empty() && Path::new(tmp).components().all(|c| !matches!(c, Component::ParentDir))
}
