//! Per-thread publish/subscribe.
//!
//! Each live thread has one [`Fanout`]. Publishing takes the fanout's lock,
//! appends the update to the thread's replication log and then hands the
//! frame to every listener, so log order equals delivery order. Listening
//! takes the same lock, which makes the sync acknowledgement and the replay
//! of missed entries land in the listener's outbox before any later update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::models::{LogEntry, PostId, Tier};
use crate::protocol::{Replicated, ServerMessage, SyncAck, Update};
use crate::store::{Store, StoreError};

pub type SessionId = u64;

/// Encoded frames headed to one connection.
pub type Outbox = mpsc::UnboundedSender<Arc<str>>;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("invalid progress counter")]
    InvalidCounter,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Clone, Debug)]
pub struct Listener {
    pub session: SessionId,
    pub ip: String,
    pub tier: Tier,
    pub outbox: Outbox,
}

#[derive(Default)]
struct Inner {
    listeners: HashMap<SessionId, Listener>,
    closed: bool,
    /// Bumped on every listener change; stale idle timers compare against it
    generation: u64,
}

impl Inner {
    fn online(&self) -> usize {
        self.listeners.values().map(|l| l.ip.as_str()).collect::<HashSet<_>>().len()
    }

    fn broadcast_count(&self) {
        let Ok(frame) = ServerMessage::SyncCount(self.online()).encode() else { return };
        let frame: Arc<str> = frame.into();
        for l in self.listeners.values() {
            let _ = l.outbox.send(frame.clone());
        }
    }
}

pub struct Fanout {
    thread: PostId,
    inner: Mutex<Inner>,
}

impl Fanout {
    fn new(thread: PostId) -> Self {
        Self { thread, inner: Mutex::new(Inner::default()) }
    }
}

#[derive(Clone)]
pub struct FanoutRegistry {
    store: Arc<dyn Store>,
    fanouts: Arc<DashMap<PostId, Arc<Fanout>>>,
    idle: Duration,
    replay_limit: u64,
    salt: Arc<str>,
}

impl FanoutRegistry {
    pub fn new(store: Arc<dyn Store>, idle: Duration, replay_limit: u64, salt: &str) -> Self {
        Self {
            store,
            fanouts: Arc::new(DashMap::new()),
            idle,
            replay_limit,
            salt: salt.into(),
        }
    }

    fn get_or_create(&self, thread: PostId) -> Arc<Fanout> {
        let mut created = false;
        let fanout = self
            .fanouts
            .entry(thread)
            .or_insert_with(|| {
                created = true;
                Arc::new(Fanout::new(thread))
            })
            .clone();
        if created {
            metrics::gauge!("rib_fanouts").set(self.fanouts.len() as f64);
            self.schedule_idle(fanout.clone(), 0);
        }
        fanout
    }

    /// Tears the fanout down after the idle period unless a listener showed up meanwhile.
    fn schedule_idle(&self, fanout: Arc<Fanout>, generation: u64) {
        let fanouts = self.fanouts.clone();
        let idle = self.idle;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let mut inner = fanout.inner.lock().await;
            if inner.closed || !inner.listeners.is_empty() || inner.generation != generation {
                return;
            }
            inner.closed = true;
            fanouts.remove_if(&fanout.thread, |_, f| Arc::ptr_eq(f, &fanout));
            metrics::gauge!("rib_fanouts").set(fanouts.len() as f64);
            debug!(thread = fanout.thread, "idle fanout removed");
        });
    }

    /// Appends `update` to the thread's log and delivers it. Returns the assigned seq.
    pub async fn publish(&self, thread: PostId, update: Update, origin_ip: Option<&str>) -> Result<u64, FanoutError> {
        loop {
            let fanout = self.get_or_create(thread);
            let inner = fanout.inner.lock().await;
            if inner.closed {
                continue;
            }
            let seq = self.store.log_len(thread).await? + 1;
            let mut msg = Replicated::new(seq, thread, update);
            let base = msg.encode()?;
            self.store
                .append_log(thread, &LogEntry { seq, payload: base.clone() })
                .await?;

            let base: Arc<str> = base.into();
            let (janitor, moderator) = match origin_ip {
                Some(ip) if matches!(msg.update, Update::InsertThread(_) | Update::InsertPost(_)) => {
                    msg.hint = Some(self.hint(ip));
                    let janitor: Arc<str> = msg.encode()?.into();
                    msg.hint = None;
                    msg.ip = Some(ip.to_string());
                    let moderator: Arc<str> = msg.encode()?.into();
                    (janitor, moderator)
                }
                _ => (base.clone(), base.clone()),
            };
            for l in inner.listeners.values() {
                let frame = match l.tier {
                    Tier::Normal => &base,
                    Tier::Janitor => &janitor,
                    Tier::Moderator => &moderator,
                };
                if l.outbox.send(frame.clone()).is_err() {
                    debug!(session = l.session, thread, "listener outbox closed");
                }
            }
            metrics::counter!("rib_fanout_publishes_total").increment(1);
            return Ok(seq);
        }
    }

    /// Registers a listener and queues the sync ack plus any replayable missed entries.
    pub async fn listen(&self, thread: PostId, listener: Listener, last_seq: u64) -> Result<SyncAck, FanoutError> {
        loop {
            let fanout = self.get_or_create(thread);
            let mut inner = fanout.inner.lock().await;
            if inner.closed {
                continue;
            }
            let len = self.store.log_len(thread).await?;
            if last_seq > len {
                return Err(FanoutError::InvalidCounter);
            }
            let missed = len - last_seq;
            let ack = SyncAck { ctr: len, replay: missed <= self.replay_limit };

            let mut frames = vec![ServerMessage::Synchronize(ack.clone()).encode()?];
            if ack.replay && missed > 0 {
                for entry in self.store.read_log(thread, last_seq + 1, len + 1).await? {
                    frames.push(entry.payload);
                }
            }
            for frame in frames {
                let _ = listener.outbox.send(frame.into());
            }

            inner.generation += 1;
            inner.listeners.insert(listener.session, listener);
            inner.broadcast_count();
            metrics::gauge!("rib_live_listeners").increment(1.0);
            return Ok(ack);
        }
    }

    pub async fn unlisten(&self, thread: PostId, session: SessionId) {
        let Some(fanout) = self.fanouts.get(&thread).map(|f| f.clone()) else { return };
        let mut inner = fanout.inner.lock().await;
        if inner.listeners.remove(&session).is_none() {
            return;
        }
        metrics::gauge!("rib_live_listeners").decrement(1.0);
        inner.generation += 1;
        if inner.listeners.is_empty() {
            let generation = inner.generation;
            drop(inner);
            self.schedule_idle(fanout, generation);
        } else {
            inner.broadcast_count();
        }
    }

    /// Drops the thread's fanout immediately, e.g. after a purge.
    pub async fn close(&self, thread: PostId) {
        let Some((_, fanout)) = self.fanouts.remove(&thread) else { return };
        let mut inner = fanout.inner.lock().await;
        inner.closed = true;
        let dropped = inner.listeners.len();
        inner.listeners.clear();
        if dropped > 0 {
            warn!(thread, dropped, "closed fanout with live listeners");
            metrics::gauge!("rib_live_listeners").decrement(dropped as f64);
        }
    }

    pub fn is_active(&self, thread: PostId) -> bool {
        self.fanouts.contains_key(&thread)
    }

    pub fn active(&self) -> usize {
        self.fanouts.len()
    }

    pub async fn online(&self, thread: PostId) -> usize {
        let Some(fanout) = self.fanouts.get(&thread).map(|f| f.clone()) else { return 0 };
        let inner = fanout.inner.lock().await;
        inner.online()
    }

    fn hint(&self, ip: &str) -> String {
        let mut h = Sha256::new();
        h.update(self.salt.as_bytes());
        h.update(ip.as_bytes());
        hex::encode(&h.finalize()[..6])
    }
}
