use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ProtocolError;
use crate::fanout::{FanoutRegistry, Outbox, SessionId};
use crate::imager::ImageAllocator;
use crate::media::MediaStore;
use crate::parent_cache::ParentCache;
use crate::protocol::ServerMessage;
use crate::rate_limit::RateLimiterFacade;
use crate::store::{Store, StoreResult};
use crate::writer::PostWriter;

/// Every live connection's outbox, for server-wide notifications.
#[derive(Default)]
pub struct SessionRegistry {
    next: AtomicU64,
    outboxes: DashMap<SessionId, Outbox>,
}

impl SessionRegistry {
    pub fn register(&self, outbox: Outbox) -> SessionId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.outboxes.insert(id, outbox);
        metrics::gauge!("rib_live_sessions").set(self.outboxes.len() as f64);
        id
    }

    pub fn remove(&self, id: SessionId) {
        self.outboxes.remove(&id);
        metrics::gauge!("rib_live_sessions").set(self.outboxes.len() as f64);
    }

    /// Sends `msg` to every session. Returns how many received it.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        let frame: Arc<str> = msg.encode()?.into();
        Ok(self
            .outboxes
            .iter()
            .filter(|o| o.value().send(frame.clone()).is_ok())
            .count())
    }

    pub fn len(&self) -> usize {
        self.outboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outboxes.is_empty()
    }
}

/// Process-scoped services, constructed once at startup and shared by handle.
pub struct Services {
    pub cfg: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub cache: Arc<ParentCache>,
    pub media: Arc<dyn MediaStore>,
    pub images: Arc<ImageAllocator>,
    pub fanout: FanoutRegistry,
    pub limits: RateLimiterFacade,
    pub writer: Arc<PostWriter>,
    pub sessions: SessionRegistry,
}

impl Services {
    pub async fn build(cfg: Config, store: Arc<dyn Store>, media: Arc<dyn MediaStore>) -> StoreResult<Arc<Self>> {
        let cfg = Arc::new(cfg);
        let cache = Arc::new(ParentCache::warm(store.as_ref()).await?);
        info!(posts = cache.len(), "parent cache warmed");
        let images = Arc::new(ImageAllocator::new(
            store.clone(),
            media.clone(),
            cfg.image_expiry,
            cfg.duplicate_window,
            cfg.max_image_name_len,
        ));
        let fanout = FanoutRegistry::new(store.clone(), cfg.fanout_idle, cfg.replay_limit, &cfg.password_salt);
        let limits = RateLimiterFacade::from_config(&cfg);
        let writer = Arc::new(PostWriter::new(
            cfg.clone(),
            store.clone(),
            cache.clone(),
            images.clone(),
            fanout.clone(),
            limits.clone(),
            media.clone(),
        ));
        Ok(Arc::new(Self {
            cfg,
            store,
            cache,
            media,
            images,
            fanout,
            limits,
            writer,
            sessions: SessionRegistry::default(),
        }))
    }

    /// Periodic housekeeping: closes stale open posts, drops expired allocations and limiter keys.
    pub async fn upkeep(&self) {
        match self.writer.close_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(n) => info!(closed = n, "closed expired open posts"),
            Err(e) => warn!(error = %e, "closing expired posts failed"),
        }
        match self.images.sweep().await {
            Ok(n) => debug!(swept = n, "image allocations swept"),
            Err(e) => warn!(error = %e, "allocation sweep failed"),
        }
        self.limits.prune();
    }

    pub fn spawn_upkeep(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let services = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                services.upkeep().await;
            }
        })
    }
}
