use std::collections::HashMap;

use dashmap::DashMap;

use crate::models::PostId;
use crate::store::{Store, StoreResult};

/// Ids per bucket. A bucket is keyed by `id / BUCKET_SIZE`.
pub const BUCKET_SIZE: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parent {
    pub board: String,
    pub thread: PostId,
}

/// Post id -> (board, thread) lookup used for link resolution and reply validation.
#[derive(Default)]
pub struct ParentCache {
    buckets: DashMap<u64, HashMap<PostId, Parent>>,
}

impl ParentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills the cache from every post in the store.
    pub async fn warm(store: &dyn Store) -> StoreResult<Self> {
        let cache = Self::new();
        for (id, board, thread) in store.parents().await? {
            cache.insert(id, &board, thread);
        }
        Ok(cache)
    }

    pub fn insert(&self, id: PostId, board: &str, thread: PostId) {
        self.buckets
            .entry(id / BUCKET_SIZE)
            .or_default()
            .insert(id, Parent { board: board.to_string(), thread });
    }

    pub fn remove(&self, id: PostId) {
        let bucket = id / BUCKET_SIZE;
        let now_empty = match self.buckets.get_mut(&bucket) {
            Some(mut b) => {
                b.remove(&id);
                b.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.buckets.remove_if(&bucket, |_, b| b.is_empty());
        }
    }

    pub fn get(&self, id: PostId) -> Option<Parent> {
        self.buckets.get(&(id / BUCKET_SIZE))?.get(&id).cloned()
    }

    pub fn is_thread(&self, id: PostId) -> bool {
        self.get(id).map(|p| p.thread == id).unwrap_or(false)
    }

    /// True if `id` is a thread on `board`.
    pub fn validate_parent(&self, id: PostId, board: &str) -> bool {
        matches!(self.get(id), Some(p) if p.thread == id && p.board == board)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
