use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::body::{commands, parse_body, ParsedBody};
use crate::config::Config;
use crate::error::PostError;
use crate::fanout::FanoutRegistry;
use crate::imager::ImageAllocator;
use crate::media::MediaStore;
use crate::models::*;
use crate::parent_cache::ParentCache;
use crate::protocol::{BanRequest, NewPost, NewThread, Update};
use crate::rate_limit::RateLimiterFacade;
use crate::store::{Store, StoreError};

/// The post a session is currently allowed to edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPost {
    pub id: PostId,
    pub thread: PostId,
    pub board: String,
}

impl OpenPost {
    fn of(post: &Post) -> Self {
        Self { id: post.id, thread: post.thread, board: post.board.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct Inserted {
    pub post: Post,
    pub bumped: bool,
}

/// Validates and persists posts, then hands the canonical updates to the fanout.
pub struct PostWriter {
    cfg: Arc<Config>,
    store: Arc<dyn Store>,
    cache: Arc<ParentCache>,
    images: Arc<ImageAllocator>,
    fanout: FanoutRegistry,
    limits: RateLimiterFacade,
    media: Arc<dyn MediaStore>,
}

impl PostWriter {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<dyn Store>,
        cache: Arc<ParentCache>,
        images: Arc<ImageAllocator>,
        fanout: FanoutRegistry,
        limits: RateLimiterFacade,
        media: Arc<dyn MediaStore>,
    ) -> Self {
        Self { cfg, store, cache, images, fanout, limits, media }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub async fn insert_thread<F>(
        &self,
        ident: &Identity,
        board: &str,
        req: NewThread,
        reserve: F,
    ) -> Result<Inserted, PostError>
    where
        F: FnOnce(PostId) + Send,
    {
        self.ensure_can_post(ident).await?;
        let Some(claim) = self.limits.claim_thread(&ident.ip) else {
            return Err(PostError::TooSoon);
        };
        let inserted = self.create_thread(ident, board, req, reserve).await;
        if inserted.is_err() {
            self.limits.release_thread(&ident.ip, claim);
        }
        inserted
    }

    async fn create_thread<F>(
        &self,
        ident: &Identity,
        board: &str,
        req: NewThread,
        reserve: F,
    ) -> Result<Inserted, PostError>
    where
        F: FnOnce(PostId) + Send,
    {
        if let Some(subject) = &req.subject {
            if subject.chars().count() > self.cfg.max_subject_len {
                return Err(PostError::FieldTooLong("subject"));
            }
        }
        self.validate_fields(&req.post)?;
        self.validate_body(&req.post.body)?;
        let Some(token) = req.post.image.as_deref() else {
            return Err(PostError::NoImage);
        };

        let id = self.store.next_post_id().await?;
        reserve(id);
        let parsed = self.parse(&req.post.body, &[]);
        let (image, hash) = self.images.redeem(token, ThumbClass::Thread).await?;

        let now = Utc::now();
        let mut rec = self.record(ident, board, id, id, &req.post, &parsed, now);
        rec.post.subject = req.subject.clone();
        rec.post.image = Some(image);
        rec.image_hash = Some(hash.clone());
        let thread = Thread {
            id,
            board: board.to_string(),
            subject: req.subject,
            created_at: now,
            bump_time: now,
            locked: false,
            post_count: 1,
            image_count: 1,
            log_ctr: 0,
        };
        self.store.insert_thread(&thread, &rec).await?;
        self.cache.insert(id, board, id);
        self.note_hash(&hash, id).await;

        self.publish(id, Update::InsertThread(rec.post.clone()), Some(&ident.ip)).await?;
        self.write_backlinks(&rec.post, &parsed).await;
        metrics::counter!("rib_posts_inserted_total", "kind" => "thread").increment(1);
        info!(id, board, "thread created");
        Ok(Inserted { post: rec.post, bumped: true })
    }

    pub async fn insert_post<F>(
        &self,
        ident: &Identity,
        board: &str,
        thread: PostId,
        req: NewPost,
        reserve: F,
    ) -> Result<Inserted, PostError>
    where
        F: FnOnce(PostId) + Send,
    {
        self.ensure_can_post(ident).await?;
        if !self.cache.validate_parent(thread, board) {
            return Err(PostError::NoThread);
        }
        let th = self.store.get_thread(thread).await.map_err(|e| match e {
            StoreError::NotFound => PostError::NoThread,
            other => other.into(),
        })?;
        if th.locked {
            return Err(PostError::Locked);
        }
        self.validate_fields(&req)?;
        if req.body.trim().is_empty() && req.image.is_none() && !req.open {
            return Err(PostError::Empty);
        }
        self.validate_body(&req.body)?;
        if !self.limits.allow_reply(&ident.ip) {
            return Err(PostError::Throttled);
        }

        let id = self.store.next_post_id().await?;
        reserve(id);
        let parsed = self.parse(&req.body, &[]);
        let image = match req.image.as_deref() {
            Some(token) => Some(self.images.redeem(token, ThumbClass::Reply).await?),
            None => None,
        };

        let now = Utc::now();
        let mut rec = self.record(ident, board, id, thread, &req, &parsed, now);
        if let Some((image, hash)) = &image {
            rec.post.image = Some(image.clone());
            rec.image_hash = Some(hash.clone());
        }
        let bumped = self.store.insert_reply(&rec, self.cfg.bump_limit_for(board)).await?;
        self.cache.insert(id, board, thread);
        if let Some((_, hash)) = &image {
            self.note_hash(hash, id).await;
        }

        self.publish(thread, Update::InsertPost(rec.post.clone()), Some(&ident.ip)).await?;
        self.write_backlinks(&rec.post, &parsed).await;
        metrics::counter!("rib_posts_inserted_total", "kind" => "reply").increment(1);
        debug!(id, thread, bumped, "reply inserted");
        Ok(Inserted { post: rec.post, bumped })
    }

    pub async fn append_body(&self, open: &OpenPost, text: &str) -> Result<(), PostError> {
        let rec = self.open_record(open).await?;
        let added = text.chars().count();
        if added == 0 {
            return Err(PostError::Empty);
        }
        if rec.post.char_len() + added > self.cfg.max_body_len {
            return Err(PostError::TooLong);
        }
        if line_count(&rec.post.text) + text.matches('\n').count() > self.cfg.max_body_lines {
            return Err(PostError::TooManyLines);
        }
        self.edit(open, Update::AppendBody { id: open.id, text: text.to_string() }).await
    }

    pub async fn backspace(&self, open: &OpenPost) -> Result<(), PostError> {
        let rec = self.open_record(open).await?;
        if rec.post.text.is_empty() {
            return Err(EditError::EmptyBody.into());
        }
        self.edit(open, Update::Backspace { id: open.id }).await
    }

    pub async fn splice_body(&self, open: &OpenPost, start: usize, len: usize, text: &str) -> Result<(), PostError> {
        let rec = self.open_record(open).await?;
        let spliced = splice_chars(&rec.post.text, start, len, text)?;
        self.validate_body(&spliced)?;
        self.edit(open, Update::SpliceBody { id: open.id, start, len, text: text.to_string() }).await
    }

    pub async fn close_post(&self, open: &OpenPost) -> Result<(), PostError> {
        let rec = self.open_record(open).await?;
        self.close_record(&rec).await
    }

    pub async fn insert_image(&self, open: &OpenPost, token: &str) -> Result<(), PostError> {
        let rec = self.open_record(open).await?;
        if rec.post.image.is_some() {
            return Err(EditError::HasImage.into());
        }
        let (image, hash) = self.images.redeem(token, ThumbClass::Reply).await?;
        self.store
            .attach_image(open.id, &image, &hash)
            .await
            .map_err(edit_conflict)?;
        self.note_hash(&hash, open.id).await;
        self.publish(open.thread, Update::InsertImage { id: open.id, image }, None).await
    }

    /// Hands an open post back to a reconnecting author.
    pub async fn reclaim(&self, id: PostId, password: &str) -> Result<OpenPost, PostError> {
        let rec = self.store.get_post(id).await?;
        match &rec.password {
            Some(stored) if rec.post.editing && *stored == self.hash_password(password) => Ok(OpenPost::of(&rec.post)),
            _ => Err(PostError::NoOpenPost),
        }
    }

    pub async fn spoiler_image(&self, ident: &Identity, id: PostId) -> Result<(), PostError> {
        require(ident, Tier::Janitor)?;
        let rec = self.store.get_post(id).await?;
        match &rec.post.image {
            Some(img) if !img.spoiler => self.moderate(&rec, Update::SpoilerImage { id }).await,
            _ => Ok(()),
        }
    }

    pub async fn delete_post(&self, ident: &Identity, id: PostId) -> Result<(), PostError> {
        require(ident, Tier::Janitor)?;
        let rec = self.store.get_post(id).await?;
        if rec.post.deleted {
            return Ok(());
        }
        self.moderate(&rec, Update::DeletePost { id }).await
    }

    pub async fn ban(&self, ident: &Identity, req: &BanRequest) -> Result<(), PostError> {
        require(ident, Tier::Moderator)?;
        let rec = self.store.get_post(req.id).await?;
        let duration = if req.duration == 0 {
            self.cfg.ban_duration
        } else {
            std::time::Duration::from_secs(req.duration)
        };
        let ban = Ban {
            ip: rec.ip.clone(),
            reason: req.reason.clone(),
            post: req.id,
            expires_at: Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::days(1)),
        };
        self.store.insert_ban(&ban).await?;
        info!(post = req.id, staff = ?ident.staff, "poster banned");
        if rec.post.banned {
            return Ok(());
        }
        self.moderate(&rec, Update::Ban { id: req.id }).await
    }

    pub async fn lock_thread(&self, ident: &Identity, thread: PostId, locked: bool) -> Result<(), PostError> {
        require(ident, Tier::Moderator)?;
        let th = self.store.set_locked(thread, locked).await.map_err(|e| match e {
            StoreError::NotFound => PostError::NoThread,
            other => other.into(),
        })?;
        self.publish(th.id, Update::LockThread { locked }, None).await
    }

    /// Removes a thread from the store, the parent cache and media storage.
    pub async fn purge_thread(&self, thread: PostId) -> Result<usize, StoreError> {
        let removed = self.store.purge_thread(thread).await?;
        self.fanout.close(thread).await;
        for rec in &removed {
            self.cache.remove(rec.post.id);
            if let Some(img) = &rec.post.image {
                let files = [
                    (FileKind::Src, Some(&img.src)),
                    (FileKind::Thumb, Some(&img.thumb)),
                    (FileKind::Mid, img.mid.as_ref()),
                ];
                for (kind, url) in files {
                    let Some(name) = url.and_then(|u| u.rsplit('/').next()) else { continue };
                    if let Err(e) = self.media.delete(kind, name).await {
                        warn!(post = rec.post.id, error = %e, "failed to delete media");
                    }
                }
            }
        }
        info!(thread, posts = removed.len(), "thread purged");
        Ok(removed.len())
    }

    /// Closes posts left open longer than the configured maximum age.
    pub async fn close_expired(&self, now: DateTime<Utc>) -> Result<usize, PostError> {
        let max_age = chrono::Duration::from_std(self.cfg.open_post_max_age).unwrap_or(chrono::Duration::minutes(30));
        let stale = self.store.open_posts(now - max_age).await?;
        let mut closed = 0;
        for rec in stale {
            match self.close_record(&rec).await {
                Ok(()) => closed += 1,
                Err(e) => warn!(id = rec.post.id, error = %e, "failed to close expired post"),
            }
        }
        Ok(closed)
    }

    async fn close_record(&self, rec: &PostRecord) -> Result<(), PostError> {
        let parsed = self.parse(&rec.post.text, &commands(&rec.post.body));
        let id = rec.post.id;
        self.store
            .update_post(id, &Update::ClosePost { id, body: parsed.segments.clone() })
            .await
            .map_err(edit_conflict)?;
        self.publish(rec.post.thread, Update::ClosePost { id, body: parsed.segments.clone() }, None)
            .await?;
        let known: Vec<PostId> = rec
            .post
            .body
            .iter()
            .filter_map(|s| match s {
                Segment::Link { link } => Some(link.id),
                _ => None,
            })
            .collect();
        let fresh = ParsedBody {
            segments: parsed.segments,
            links: parsed.links.into_iter().filter(|l| !known.contains(&l.id)).collect(),
        };
        self.write_backlinks(&rec.post, &fresh).await;
        Ok(())
    }

    async fn open_record(&self, open: &OpenPost) -> Result<PostRecord, PostError> {
        let rec = self.store.get_post(open.id).await.map_err(|e| match e {
            StoreError::NotFound => PostError::NoOpenPost,
            other => other.into(),
        })?;
        if !rec.post.editing {
            return Err(EditError::NotOpen.into());
        }
        Ok(rec)
    }

    async fn edit(&self, open: &OpenPost, update: Update) -> Result<(), PostError> {
        self.store.update_post(open.id, &update).await.map_err(edit_conflict)?;
        self.publish(open.thread, update, None).await
    }

    async fn moderate(&self, rec: &PostRecord, update: Update) -> Result<(), PostError> {
        self.store.update_post(rec.post.id, &update).await?;
        self.publish(rec.post.thread, update, None).await
    }

    async fn publish(&self, thread: PostId, update: Update, origin_ip: Option<&str>) -> Result<(), PostError> {
        self.fanout
            .publish(thread, update, origin_ip)
            .await
            .map(|_| ())
            .map_err(|e| PostError::Infrastructure(e.to_string()))
    }

    /// Records backlinks on link targets and notifies their threads. Failures are logged only.
    async fn write_backlinks(&self, post: &Post, parsed: &ParsedBody) {
        for link in parsed.links.iter().filter(|l| l.id != post.id) {
            let update = Update::Backlink {
                id: link.id,
                by: post.id,
                by_thread: post.thread,
                board: post.board.clone(),
            };
            if let Err(e) = self.store.update_post(link.id, &update).await {
                warn!(target = link.id, by = post.id, error = %e, "failed to store backlink");
                continue;
            }
            if let Err(e) = self.fanout.publish(link.thread, update, None).await {
                warn!(target = link.id, by = post.id, error = %e, "failed to publish backlink");
            }
        }
    }

    async fn ensure_can_post(&self, ident: &Identity) -> Result<(), PostError> {
        if self.cfg.read_only {
            return Err(PostError::ReadOnly);
        }
        if self.store.active_ban(&ident.ip, Utc::now()).await?.is_some() {
            return Err(PostError::Banned);
        }
        Ok(())
    }

    fn validate_fields(&self, req: &NewPost) -> Result<(), PostError> {
        if req.name.as_deref().map(|n| n.chars().count()).unwrap_or(0) > self.cfg.max_name_len {
            return Err(PostError::FieldTooLong("name"));
        }
        if req.email.as_deref().map(|n| n.chars().count()).unwrap_or(0) > self.cfg.max_name_len {
            return Err(PostError::FieldTooLong("email"));
        }
        if req.password.as_deref().map(|n| n.chars().count()).unwrap_or(0) > self.cfg.max_name_len {
            return Err(PostError::FieldTooLong("password"));
        }
        Ok(())
    }

    fn validate_body(&self, body: &str) -> Result<(), PostError> {
        if body.chars().count() > self.cfg.max_body_len {
            return Err(PostError::TooLong);
        }
        if line_count(body) > self.cfg.max_body_lines {
            return Err(PostError::TooManyLines);
        }
        Ok(())
    }

    fn parse(&self, text: &str, prior: &[Command]) -> ParsedBody {
        let mut rng = rand::thread_rng();
        parse_body(text, &self.cache, &mut rng, prior)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        ident: &Identity,
        board: &str,
        id: PostId,
        thread: PostId,
        req: &NewPost,
        parsed: &ParsedBody,
        now: DateTime<Utc>,
    ) -> PostRecord {
        let (name, trip) = split_tripcode(req.name.as_deref(), &self.cfg.password_salt);
        let email = req.email.clone().filter(|e| !e.trim().is_empty());
        let sage = req.sage || email.as_deref().map(|e| e.eq_ignore_ascii_case("sage")).unwrap_or(false);
        PostRecord {
            post: Post {
                id,
                thread,
                board: board.to_string(),
                time: now,
                editing: req.open,
                sage,
                deleted: false,
                banned: false,
                subject: None,
                name,
                trip,
                email,
                auth: capcode(ident),
                image: None,
                text: req.body.clone(),
                body: parsed.segments.clone(),
                backlinks: Default::default(),
            },
            ip: ident.ip.clone(),
            password: match (&req.password, req.open) {
                (Some(pw), true) if !pw.is_empty() => Some(self.hash_password(pw)),
                _ => None,
            },
            image_hash: None,
        }
    }

    fn hash_password(&self, password: &str) -> String {
        let mut h = Sha256::new();
        h.update(self.cfg.password_salt.as_bytes());
        h.update(password.as_bytes());
        hex::encode(h.finalize())
    }

    async fn note_hash(&self, hash: &str, post: PostId) {
        if let Err(e) = self.images.note_hash(hash, post).await {
            warn!(post, error = %e, "failed to note image hash");
        }
    }
}

fn require(ident: &Identity, tier: Tier) -> Result<(), PostError> {
    if ident.tier.at_least(tier) { Ok(()) } else { Err(PostError::Forbidden) }
}

fn edit_conflict(e: StoreError) -> PostError {
    match e {
        StoreError::Conflict => EditError::NotOpen.into(),
        StoreError::NotFound => PostError::NoOpenPost,
        other => other.into(),
    }
}

fn line_count(text: &str) -> usize {
    text.matches('\n').count()
}

fn capcode(ident: &Identity) -> Option<String> {
    match ident.tier {
        Tier::Normal => None,
        Tier::Janitor => Some("janitor".into()),
        Tier::Moderator => Some("moderator".into()),
    }
    .filter(|_| ident.staff.is_some())
}

/// `name#secret` -> (name, tripcode).
fn split_tripcode(raw: Option<&str>, salt: &str) -> (Option<String>, Option<String>) {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else { return (None, None) };
    match raw.split_once('#') {
        Some((name, secret)) if !secret.is_empty() => {
            let mut h = Sha256::new();
            h.update(salt.as_bytes());
            h.update(secret.as_bytes());
            let trip = hex::encode(&h.finalize()[..5]);
            let name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
            (name, Some(trip))
        }
        Some((name, _)) => (Some(name.trim().to_string()).filter(|n| !n.is_empty()), None),
        None => (Some(raw.to_string()), None),
    }
}
