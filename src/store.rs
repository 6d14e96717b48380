use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::*;
use crate::protocol::Update;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("internal: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Atomically increments the global post counter.
    async fn next_post_id(&self) -> StoreResult<PostId>;
    async fn insert_thread(&self, thread: &Thread, op: &PostRecord) -> StoreResult<()>;
    /// Persists a reply and updates the thread counters. Returns whether the thread was bumped.
    async fn insert_reply(&self, post: &PostRecord, bump_limit: u32) -> StoreResult<bool>;
    async fn get_post(&self, id: PostId) -> StoreResult<PostRecord>;
    async fn get_thread(&self, id: PostId) -> StoreResult<Thread>;
    async fn thread_posts(&self, thread: PostId) -> StoreResult<Vec<PostRecord>>;
    /// Applies a post-level update. Edits that do not apply yield `Conflict`.
    async fn update_post(&self, id: PostId, update: &Update) -> StoreResult<PostRecord>;
    async fn attach_image(&self, id: PostId, image: &Image, hash: &str) -> StoreResult<PostRecord>;
    async fn set_locked(&self, thread: PostId, locked: bool) -> StoreResult<Thread>;
    async fn open_posts(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<PostRecord>>;
    /// Removes a thread with all its posts and log. Returns the removed posts.
    async fn purge_thread(&self, thread: PostId) -> StoreResult<Vec<PostRecord>>;
    /// `(id, board, thread)` for every stored post.
    async fn parents(&self) -> StoreResult<Vec<(PostId, String, PostId)>>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn log_len(&self, thread: PostId) -> StoreResult<u64>;
    /// `entry.seq` must be exactly one past the current length, otherwise `Conflict`.
    async fn append_log(&self, thread: PostId, entry: &LogEntry) -> StoreResult<()>;
    /// Entries with `start <= seq < end`, ascending.
    async fn read_log(&self, thread: PostId, start: u64, end: u64) -> StoreResult<Vec<LogEntry>>;
}

#[async_trait]
pub trait AllocationStore: Send + Sync {
    async fn put_allocation(&self, token: &str, desc: &ImageDescriptor, expires_at: DateTime<Utc>) -> StoreResult<()>;
    /// Test-and-set. False when an unexpired lock already exists.
    async fn lock_allocation(&self, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> StoreResult<bool>;
    async fn get_allocation(&self, token: &str, now: DateTime<Utc>) -> StoreResult<Option<ImageDescriptor>>;
    /// Drops the descriptor. The lock stays until it expires.
    async fn consume_allocation(&self, token: &str) -> StoreResult<()>;
    async fn unlock_allocation(&self, token: &str) -> StoreResult<()>;
    async fn note_hash(&self, hash: &str, post: PostId, expires_at: DateTime<Utc>) -> StoreResult<()>;
    async fn find_hash(&self, hash: &str, now: DateTime<Utc>) -> StoreResult<Option<PostId>>;
    async fn sweep_allocations(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}

#[async_trait]
pub trait ModerationStore: Send + Sync {
    async fn insert_ban(&self, ban: &Ban) -> StoreResult<()>;
    async fn active_ban(&self, ip: &str, now: DateTime<Utc>) -> StoreResult<Option<Ban>>;
}

pub trait Store: PostStore + LogStore + AllocationStore + ModerationStore {}

impl<T> Store for T where T: PostStore + LogStore + AllocationStore + ModerationStore {}

/// Bump rule shared by the backends.
pub(crate) fn should_bump(post: &PostRecord, replies_before: u32, bump_limit: u32) -> bool {
    !post.post.sage && replies_before < bump_limit
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use parking_lot::RwLock;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tracing::{info, warn};

    #[derive(Default, Serialize, Deserialize)]
    struct Allocation {
        descriptor: Option<ImageDescriptor>,
        expires_at: Option<DateTime<Utc>>,
        locked_until: Option<DateTime<Utc>>,
    }

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        next_id: PostId,
        threads: HashMap<PostId, Thread>,
        posts: BTreeMap<PostId, PostRecord>,
        logs: HashMap<PostId, Vec<LogEntry>>,
        #[serde(default)]
        allocations: HashMap<String, Allocation>,
        #[serde(default)]
        hashes: HashMap<String, (PostId, DateTime<Utc>)>,
        #[serde(default)]
        bans: Vec<Ban>,
    }

    #[derive(Clone, Default)]
    pub struct InMemStore {
        state: Arc<RwLock<State>>,
        snapshot_path: Option<Arc<PathBuf>>,
        /// Bumped after every mutation
        version: Arc<AtomicU64>,
        /// Version held by the file on disk; serialises snapshot writers
        written: Arc<tokio::sync::Mutex<u64>>,
    }

    impl InMemStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Loads `<dir>/state.json` if present and rewrites it after every mutation.
        pub fn with_snapshot(dir: &Path) -> Self {
            let path = dir.join("state.json");
            let state = Self::load_state_from(&path);
            Self { state: Arc::new(RwLock::new(state)), snapshot_path: Some(Arc::new(path)), ..Self::default() }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        info!(path = %path.display(), "loaded snapshot");
                        s
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to parse snapshot, starting empty");
                        State::default()
                    }
                },
                Err(e) => {
                    info!(path = %path.display(), error = %e, "no snapshot, starting empty");
                    State::default()
                }
            }
        }

        /// Writes the current state to disk. Called after the mutation it covers; a write
        /// already holding a newer version makes this one a no-op.
        async fn persist(&self) {
            let Some(path) = self.snapshot_path.as_ref() else { return };
            let wanted = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            let mut written = self.written.lock().await;
            if *written >= wanted {
                return;
            }
            let version = self.version.load(Ordering::SeqCst);
            let bytes = match self.encode_state() {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "failed to serialise snapshot");
                    return;
                }
            };
            match write_atomic(path, &bytes).await {
                Ok(()) => *written = version,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to write snapshot"),
            }
        }

        fn encode_state(&self) -> serde_json::Result<Vec<u8>> {
            let s = self.state.read();
            serde_json::to_vec(&*s)
        }
    }

    /// Writes next to `path` and renames over it so readers never see a torn file.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }

    #[async_trait]
    impl PostStore for InMemStore {
        async fn next_post_id(&self) -> StoreResult<PostId> {
            let id = {
                let mut s = self.state.write();
                s.next_id += 1;
                s.next_id
            };
            self.persist().await;
            Ok(id)
        }

        async fn insert_thread(&self, thread: &Thread, op: &PostRecord) -> StoreResult<()> {
            {
                let mut s = self.state.write();
                if s.threads.contains_key(&thread.id) || s.posts.contains_key(&op.post.id) {
                    return Err(StoreError::Conflict);
                }
                s.threads.insert(thread.id, thread.clone());
                s.posts.insert(op.post.id, op.clone());
                s.logs.entry(thread.id).or_default();
            }
            self.persist().await;
            Ok(())
        }

        async fn insert_reply(&self, post: &PostRecord, bump_limit: u32) -> StoreResult<bool> {
            let bumped = {
                let mut s = self.state.write();
                if s.posts.contains_key(&post.post.id) {
                    return Err(StoreError::Conflict);
                }
                let th = s.threads.get_mut(&post.post.thread).ok_or(StoreError::NotFound)?;
                let bumped = should_bump(post, th.reply_count(), bump_limit);
                th.post_count += 1;
                if post.post.image.is_some() {
                    th.image_count += 1;
                }
                if bumped {
                    th.bump_time = post.post.time;
                }
                s.posts.insert(post.post.id, post.clone());
                bumped
            };
            self.persist().await;
            Ok(bumped)
        }

        async fn get_post(&self, id: PostId) -> StoreResult<PostRecord> {
            self.state.read().posts.get(&id).cloned().ok_or(StoreError::NotFound)
        }

        async fn get_thread(&self, id: PostId) -> StoreResult<Thread> {
            self.state.read().threads.get(&id).cloned().ok_or(StoreError::NotFound)
        }

        async fn thread_posts(&self, thread: PostId) -> StoreResult<Vec<PostRecord>> {
            let s = self.state.read();
            Ok(s.posts.values().filter(|p| p.post.thread == thread).cloned().collect())
        }

        async fn update_post(&self, id: PostId, update: &Update) -> StoreResult<PostRecord> {
            let rec = {
                let mut s = self.state.write();
                let rec = s.posts.get_mut(&id).ok_or(StoreError::NotFound)?;
                rec.post.apply(update).map_err(|_| StoreError::Conflict)?;
                if matches!(update, Update::ClosePost { .. }) {
                    rec.password = None;
                }
                rec.clone()
            };
            self.persist().await;
            Ok(rec)
        }

        async fn attach_image(&self, id: PostId, image: &Image, hash: &str) -> StoreResult<PostRecord> {
            let rec = {
                let mut s = self.state.write();
                let rec = s.posts.get_mut(&id).ok_or(StoreError::NotFound)?;
                rec.post
                    .apply(&Update::InsertImage { id, image: image.clone() })
                    .map_err(|_| StoreError::Conflict)?;
                rec.image_hash = Some(hash.to_string());
                let rec = rec.clone();
                if let Some(th) = s.threads.get_mut(&rec.post.thread) {
                    th.image_count += 1;
                }
                rec
            };
            self.persist().await;
            Ok(rec)
        }

        async fn set_locked(&self, thread: PostId, locked: bool) -> StoreResult<Thread> {
            let th = {
                let mut s = self.state.write();
                let th = s.threads.get_mut(&thread).ok_or(StoreError::NotFound)?;
                th.locked = locked;
                th.clone()
            };
            self.persist().await;
            Ok(th)
        }

        async fn open_posts(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<PostRecord>> {
            let s = self.state.read();
            Ok(s.posts
                .values()
                .filter(|p| p.post.editing && p.post.time < older_than)
                .cloned()
                .collect())
        }

        async fn purge_thread(&self, thread: PostId) -> StoreResult<Vec<PostRecord>> {
            let removed = {
                let mut s = self.state.write();
                s.threads.remove(&thread).ok_or(StoreError::NotFound)?;
                s.logs.remove(&thread);
                let ids: Vec<PostId> = s
                    .posts
                    .values()
                    .filter(|p| p.post.thread == thread)
                    .map(|p| p.post.id)
                    .collect();
                ids.iter().filter_map(|id| s.posts.remove(id)).collect::<Vec<_>>()
            };
            self.persist().await;
            Ok(removed)
        }

        async fn parents(&self) -> StoreResult<Vec<(PostId, String, PostId)>> {
            let s = self.state.read();
            Ok(s.posts
                .values()
                .map(|p| (p.post.id, p.post.board.clone(), p.post.thread))
                .collect())
        }
    }

    #[async_trait]
    impl LogStore for InMemStore {
        async fn log_len(&self, thread: PostId) -> StoreResult<u64> {
            let s = self.state.read();
            if !s.threads.contains_key(&thread) {
                return Err(StoreError::NotFound);
            }
            Ok(s.logs.get(&thread).map(|l| l.len() as u64).unwrap_or(0))
        }

        async fn append_log(&self, thread: PostId, entry: &LogEntry) -> StoreResult<()> {
            {
                let mut s = self.state.write();
                let s = &mut *s;
                let th = s.threads.get_mut(&thread).ok_or(StoreError::NotFound)?;
                let log = s.logs.entry(thread).or_default();
                if entry.seq != log.len() as u64 + 1 {
                    return Err(StoreError::Conflict);
                }
                log.push(entry.clone());
                th.log_ctr = entry.seq;
            }
            self.persist().await;
            Ok(())
        }

        async fn read_log(&self, thread: PostId, start: u64, end: u64) -> StoreResult<Vec<LogEntry>> {
            let s = self.state.read();
            let log = s.logs.get(&thread).ok_or(StoreError::NotFound)?;
            Ok(log
                .iter()
                .filter(|e| e.seq >= start && e.seq < end)
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl AllocationStore for InMemStore {
        async fn put_allocation(&self, token: &str, desc: &ImageDescriptor, expires_at: DateTime<Utc>) -> StoreResult<()> {
            {
                let mut s = self.state.write();
                let a = s.allocations.entry(token.to_string()).or_default();
                if a.descriptor.is_some() || a.locked_until.is_some() {
                    return Err(StoreError::Conflict);
                }
                a.descriptor = Some(desc.clone());
                a.expires_at = Some(expires_at);
            }
            self.persist().await;
            Ok(())
        }

        async fn lock_allocation(&self, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> StoreResult<bool> {
            let mut s = self.state.write();
            let a = s.allocations.entry(token.to_string()).or_default();
            match a.locked_until {
                Some(until) if until > now => Ok(false),
                _ => {
                    a.locked_until = Some(expires_at);
                    Ok(true)
                }
            }
        }

        async fn get_allocation(&self, token: &str, now: DateTime<Utc>) -> StoreResult<Option<ImageDescriptor>> {
            let s = self.state.read();
            Ok(s.allocations.get(token).and_then(|a| match a.expires_at {
                Some(exp) if exp > now => a.descriptor.clone(),
                _ => None,
            }))
        }

        async fn consume_allocation(&self, token: &str) -> StoreResult<()> {
            {
                let mut s = self.state.write();
                if let Some(a) = s.allocations.get_mut(token) {
                    a.descriptor = None;
                    a.expires_at = None;
                }
            }
            self.persist().await;
            Ok(())
        }

        async fn unlock_allocation(&self, token: &str) -> StoreResult<()> {
            let mut s = self.state.write();
            if let Some(a) = s.allocations.get_mut(token) {
                a.locked_until = None;
            }
            Ok(())
        }

        async fn note_hash(&self, hash: &str, post: PostId, expires_at: DateTime<Utc>) -> StoreResult<()> {
            self.state.write().hashes.insert(hash.to_string(), (post, expires_at));
            Ok(())
        }

        async fn find_hash(&self, hash: &str, now: DateTime<Utc>) -> StoreResult<Option<PostId>> {
            let s = self.state.read();
            Ok(s.hashes.get(hash).filter(|(_, exp)| *exp > now).map(|(id, _)| *id))
        }

        async fn sweep_allocations(&self, now: DateTime<Utc>) -> StoreResult<usize> {
            let mut s = self.state.write();
            let before = s.allocations.len() + s.hashes.len();
            s.allocations.retain(|_, a| {
                let live_desc = a.expires_at.map(|e| e > now).unwrap_or(false) && a.descriptor.is_some();
                let live_lock = a.locked_until.map(|e| e > now).unwrap_or(false);
                live_desc || live_lock
            });
            s.hashes.retain(|_, (_, exp)| *exp > now);
            Ok(before - s.allocations.len() - s.hashes.len())
        }
    }

    #[async_trait]
    impl ModerationStore for InMemStore {
        async fn insert_ban(&self, ban: &Ban) -> StoreResult<()> {
            self.state.write().bans.push(ban.clone());
            self.persist().await;
            Ok(())
        }

        async fn active_ban(&self, ip: &str, now: DateTime<Utc>) -> StoreResult<Option<Ban>> {
            let s = self.state.read();
            Ok(s.bans.iter().find(|b| b.ip == ip && b.expires_at > now).cloned())
        }
    }

}

#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::types::Json;
    use sqlx::{PgPool, Row};

    fn internal(e: sqlx::Error) -> StoreError {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            other => StoreError::Internal(other.to_string()),
        }
    }

    #[derive(sqlx::FromRow)]
    struct ThreadRow {
        id: i64,
        board: String,
        subject: Option<String>,
        created_at: DateTime<Utc>,
        bump_time: DateTime<Utc>,
        locked: bool,
        post_count: i32,
        image_count: i32,
        log_ctr: i64,
    }

    impl From<ThreadRow> for Thread {
        fn from(r: ThreadRow) -> Self {
            Thread {
                id: r.id as PostId,
                board: r.board,
                subject: r.subject,
                created_at: r.created_at,
                bump_time: r.bump_time,
                locked: r.locked,
                post_count: r.post_count as u32,
                image_count: r.image_count as u32,
                log_ctr: r.log_ctr as u64,
            }
        }
    }

    const THREAD_COLUMNS: &str =
        "id, board, subject, created_at, bump_time, locked, post_count, image_count, log_ctr";

    #[derive(Clone)]
    pub struct PgStore {
        pool: PgPool,
    }

    impl PgStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn migrate(&self) -> StoreResult<()> {
            sqlx::migrate!("./migrations")
                .run(&self.pool)
                .await
                .map_err(|e| StoreError::Internal(e.to_string()))
        }

        async fn mutate_post<F>(&self, id: PostId, f: F) -> StoreResult<PostRecord>
        where
            F: FnOnce(&mut PostRecord) -> StoreResult<()> + Send,
        {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let Json(mut rec): Json<PostRecord> =
                sqlx::query_scalar("SELECT record FROM posts WHERE id = $1 FOR UPDATE")
                    .bind(id as i64)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(internal)?;
            f(&mut rec)?;
            sqlx::query("UPDATE posts SET record = $2, editing = $3 WHERE id = $1")
                .bind(id as i64)
                .bind(Json(&rec))
                .bind(rec.post.editing)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(rec)
        }
    }

    #[async_trait]
    impl PostStore for PgStore {
        async fn next_post_id(&self) -> StoreResult<PostId> {
            let id: i64 = sqlx::query_scalar("SELECT nextval('post_ids')")
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(id as PostId)
        }

        async fn insert_thread(&self, thread: &Thread, op: &PostRecord) -> StoreResult<()> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            sqlx::query(
                "INSERT INTO threads (id, board, subject, created_at, bump_time, locked, post_count, image_count, log_ctr) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
            )
            .bind(thread.id as i64)
            .bind(&thread.board)
            .bind(&thread.subject)
            .bind(thread.created_at)
            .bind(thread.bump_time)
            .bind(thread.locked)
            .bind(thread.post_count as i32)
            .bind(thread.image_count as i32)
            .bind(thread.log_ctr as i64)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            sqlx::query("INSERT INTO posts (id, thread, board, editing, time, record) VALUES ($1,$2,$3,$4,$5,$6)")
                .bind(op.post.id as i64)
                .bind(op.post.thread as i64)
                .bind(&op.post.board)
                .bind(op.post.editing)
                .bind(op.post.time)
                .bind(Json(op))
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            tx.commit().await.map_err(internal)
        }

        async fn insert_reply(&self, post: &PostRecord, bump_limit: u32) -> StoreResult<bool> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let row = sqlx::query("SELECT post_count FROM threads WHERE id = $1 FOR UPDATE")
                .bind(post.post.thread as i64)
                .fetch_one(&mut *tx)
                .await
                .map_err(internal)?;
            let post_count: i32 = row.try_get("post_count").map_err(internal)?;
            let bumped = should_bump(post, (post_count as u32).saturating_sub(1), bump_limit);
            sqlx::query(
                "UPDATE threads SET post_count = post_count + 1, \
                 image_count = image_count + $2, \
                 bump_time = CASE WHEN $3 THEN $4 ELSE bump_time END \
                 WHERE id = $1",
            )
            .bind(post.post.thread as i64)
            .bind(i32::from(post.post.image.is_some()))
            .bind(bumped)
            .bind(post.post.time)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
            sqlx::query("INSERT INTO posts (id, thread, board, editing, time, record) VALUES ($1,$2,$3,$4,$5,$6)")
                .bind(post.post.id as i64)
                .bind(post.post.thread as i64)
                .bind(&post.post.board)
                .bind(post.post.editing)
                .bind(post.post.time)
                .bind(Json(post))
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            tx.commit().await.map_err(internal)?;
            Ok(bumped)
        }

        async fn get_post(&self, id: PostId) -> StoreResult<PostRecord> {
            let Json(rec): Json<PostRecord> = sqlx::query_scalar("SELECT record FROM posts WHERE id = $1")
                .bind(id as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(rec)
        }

        async fn get_thread(&self, id: PostId) -> StoreResult<Thread> {
            let row = sqlx::query_as::<_, ThreadRow>(&format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = $1"))
                .bind(id as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(row.into())
        }

        async fn thread_posts(&self, thread: PostId) -> StoreResult<Vec<PostRecord>> {
            let rows: Vec<Json<PostRecord>> =
                sqlx::query_scalar("SELECT record FROM posts WHERE thread = $1 ORDER BY id")
                    .bind(thread as i64)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(internal)?;
            Ok(rows.into_iter().map(|Json(r)| r).collect())
        }

        async fn update_post(&self, id: PostId, update: &Update) -> StoreResult<PostRecord> {
            let update = update.clone();
            self.mutate_post(id, move |rec| {
                rec.post.apply(&update).map_err(|_| StoreError::Conflict)?;
                if matches!(update, Update::ClosePost { .. }) {
                    rec.password = None;
                }
                Ok(())
            })
            .await
        }

        async fn attach_image(&self, id: PostId, image: &Image, hash: &str) -> StoreResult<PostRecord> {
            let image = image.clone();
            let hash = hash.to_string();
            let rec = self
                .mutate_post(id, move |rec| {
                    rec.post
                        .apply(&Update::InsertImage { id, image })
                        .map_err(|_| StoreError::Conflict)?;
                    rec.image_hash = Some(hash);
                    Ok(())
                })
                .await?;
            sqlx::query("UPDATE threads SET image_count = image_count + 1 WHERE id = $1")
                .bind(rec.post.thread as i64)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(rec)
        }

        async fn set_locked(&self, thread: PostId, locked: bool) -> StoreResult<Thread> {
            let row = sqlx::query_as::<_, ThreadRow>(&format!(
                "UPDATE threads SET locked = $2 WHERE id = $1 RETURNING {THREAD_COLUMNS}"
            ))
            .bind(thread as i64)
            .bind(locked)
            .fetch_one(&self.pool)
            .await
            .map_err(internal)?;
            Ok(row.into())
        }

        async fn open_posts(&self, older_than: DateTime<Utc>) -> StoreResult<Vec<PostRecord>> {
            let rows: Vec<Json<PostRecord>> =
                sqlx::query_scalar("SELECT record FROM posts WHERE editing AND time < $1 ORDER BY id")
                    .bind(older_than)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(internal)?;
            Ok(rows.into_iter().map(|Json(r)| r).collect())
        }

        async fn purge_thread(&self, thread: PostId) -> StoreResult<Vec<PostRecord>> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let rows: Vec<Json<PostRecord>> =
                sqlx::query_scalar("DELETE FROM posts WHERE thread = $1 RETURNING record")
                    .bind(thread as i64)
                    .fetch_all(&mut *tx)
                    .await
                    .map_err(internal)?;
            let deleted = sqlx::query("DELETE FROM threads WHERE id = $1")
                .bind(thread as i64)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            if deleted.rows_affected() == 0 {
                return Err(StoreError::NotFound);
            }
            tx.commit().await.map_err(internal)?;
            Ok(rows.into_iter().map(|Json(r)| r).collect())
        }

        async fn parents(&self) -> StoreResult<Vec<(PostId, String, PostId)>> {
            let rows = sqlx::query("SELECT id, board, thread FROM posts")
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            rows.into_iter()
                .map(|r| {
                    let id: i64 = r.try_get("id").map_err(internal)?;
                    let board: String = r.try_get("board").map_err(internal)?;
                    let thread: i64 = r.try_get("thread").map_err(internal)?;
                    Ok((id as PostId, board, thread as PostId))
                })
                .collect()
        }
    }

    #[async_trait]
    impl LogStore for PgStore {
        async fn log_len(&self, thread: PostId) -> StoreResult<u64> {
            let ctr: i64 = sqlx::query_scalar("SELECT log_ctr FROM threads WHERE id = $1")
                .bind(thread as i64)
                .fetch_one(&self.pool)
                .await
                .map_err(internal)?;
            Ok(ctr as u64)
        }

        async fn append_log(&self, thread: PostId, entry: &LogEntry) -> StoreResult<()> {
            let mut tx = self.pool.begin().await.map_err(internal)?;
            let advanced = sqlx::query("UPDATE threads SET log_ctr = $2 WHERE id = $1 AND log_ctr = $2 - 1")
                .bind(thread as i64)
                .bind(entry.seq as i64)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            if advanced.rows_affected() == 0 {
                return Err(StoreError::Conflict);
            }
            sqlx::query("INSERT INTO thread_log (thread, seq, payload) VALUES ($1,$2,$3)")
                .bind(thread as i64)
                .bind(entry.seq as i64)
                .bind(&entry.payload)
                .execute(&mut *tx)
                .await
                .map_err(internal)?;
            tx.commit().await.map_err(internal)
        }

        async fn read_log(&self, thread: PostId, start: u64, end: u64) -> StoreResult<Vec<LogEntry>> {
            let rows = sqlx::query(
                "SELECT seq, payload FROM thread_log WHERE thread = $1 AND seq >= $2 AND seq < $3 ORDER BY seq",
            )
            .bind(thread as i64)
            .bind(start as i64)
            .bind(end.min(i64::MAX as u64) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
            rows.into_iter()
                .map(|r| {
                    let seq: i64 = r.try_get("seq").map_err(internal)?;
                    Ok(LogEntry { seq: seq as u64, payload: r.try_get("payload").map_err(internal)? })
                })
                .collect()
        }
    }

    #[async_trait]
    impl AllocationStore for PgStore {
        async fn put_allocation(&self, token: &str, desc: &ImageDescriptor, expires_at: DateTime<Utc>) -> StoreResult<()> {
            sqlx::query("INSERT INTO image_allocations (token, descriptor, expires_at) VALUES ($1,$2,$3)")
                .bind(token)
                .bind(Json(desc))
                .bind(expires_at)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }

        async fn lock_allocation(&self, token: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> StoreResult<bool> {
            let res = sqlx::query(
                "INSERT INTO image_locks (token, expires_at) VALUES ($1,$2) \
                 ON CONFLICT (token) DO UPDATE SET expires_at = EXCLUDED.expires_at \
                 WHERE image_locks.expires_at <= $3",
            )
            .bind(token)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(res.rows_affected() == 1)
        }

        async fn get_allocation(&self, token: &str, now: DateTime<Utc>) -> StoreResult<Option<ImageDescriptor>> {
            let row: Option<Json<ImageDescriptor>> = sqlx::query_scalar(
                "SELECT descriptor FROM image_allocations WHERE token = $1 AND expires_at > $2",
            )
            .bind(token)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
            Ok(row.map(|Json(d)| d))
        }

        async fn consume_allocation(&self, token: &str) -> StoreResult<()> {
            sqlx::query("DELETE FROM image_allocations WHERE token = $1")
                .bind(token)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }

        async fn unlock_allocation(&self, token: &str) -> StoreResult<()> {
            sqlx::query("DELETE FROM image_locks WHERE token = $1")
                .bind(token)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }

        async fn note_hash(&self, hash: &str, post: PostId, expires_at: DateTime<Utc>) -> StoreResult<()> {
            sqlx::query(
                "INSERT INTO image_hashes (hash, post, expires_at) VALUES ($1,$2,$3) \
                 ON CONFLICT (hash) DO UPDATE SET post = EXCLUDED.post, expires_at = EXCLUDED.expires_at",
            )
            .bind(hash)
            .bind(post as i64)
            .bind(expires_at)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            Ok(())
        }

        async fn find_hash(&self, hash: &str, now: DateTime<Utc>) -> StoreResult<Option<PostId>> {
            let id: Option<i64> =
                sqlx::query_scalar("SELECT post FROM image_hashes WHERE hash = $1 AND expires_at > $2")
                    .bind(hash)
                    .bind(now)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(internal)?;
            Ok(id.map(|i| i as PostId))
        }

        async fn sweep_allocations(&self, now: DateTime<Utc>) -> StoreResult<usize> {
            let mut n = 0;
            for table in ["image_allocations", "image_locks", "image_hashes"] {
                let res = sqlx::query(&format!("DELETE FROM {table} WHERE expires_at <= $1"))
                    .bind(now)
                    .execute(&self.pool)
                    .await
                    .map_err(internal)?;
                n += res.rows_affected() as usize;
            }
            Ok(n)
        }
    }

    #[async_trait]
    impl ModerationStore for PgStore {
        async fn insert_ban(&self, ban: &Ban) -> StoreResult<()> {
            sqlx::query("INSERT INTO bans (ip, reason, post, expires_at) VALUES ($1,$2,$3,$4)")
                .bind(&ban.ip)
                .bind(&ban.reason)
                .bind(ban.post as i64)
                .bind(ban.expires_at)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }

        async fn active_ban(&self, ip: &str, now: DateTime<Utc>) -> StoreResult<Option<Ban>> {
            let row = sqlx::query(
                "SELECT ip, reason, post, expires_at FROM bans WHERE ip = $1 AND expires_at > $2 \
                 ORDER BY expires_at DESC LIMIT 1",
            )
            .bind(ip)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
            row.map(|r| {
                let post: i64 = r.try_get("post").map_err(internal)?;
                Ok(Ban {
                    ip: r.try_get("ip").map_err(internal)?,
                    reason: r.try_get("reason").map_err(internal)?,
                    post: post as PostId,
                    expires_at: r.try_get("expires_at").map_err(internal)?,
                })
            })
            .transpose()
        }
    }
}
