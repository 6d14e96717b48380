use std::collections::BTreeMap;

use super::ClientError;
use crate::models::{Post, PostId};
use crate::protocol::Update;

/// A client's view of one thread, rebuilt purely from replicated updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadModel {
    pub id: PostId,
    pub locked: bool,
    pub posts: BTreeMap<PostId, Post>,
}

impl ThreadModel {
    pub fn new(id: PostId) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn apply(&mut self, update: &Update) -> Result<(), ClientError> {
        match update {
            Update::InsertThread(post) | Update::InsertPost(post) => {
                self.posts.insert(post.id, post.clone());
            }
            Update::LockThread { locked } => self.locked = *locked,
            other => {
                let Some(id) = other.target() else { return Ok(()) };
                let post = self.posts.get_mut(&id).ok_or(ClientError::UnknownPost(id))?;
                post.apply(other).map_err(|source| ClientError::Edit { id, source })?;
            }
        }
        Ok(())
    }

    pub fn get(&self, id: PostId) -> Option<&Post> {
        self.posts.get(&id)
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}
