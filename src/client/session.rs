use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::model::ThreadModel;
use crate::models::PostId;
use crate::protocol::{ClientMessage, Redirect, Rejection, Replicated, ServerMessage, SyncAck, SyncRequest};

/// Delay before a successful sync is trusted enough to reset the retry counter.
pub const ATTEMPT_RESET: Duration = Duration::from_secs(10);

const BASE_RETRY_MS: f64 = 500.0;
const MAX_RETRY_EXPONENT: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Loading,
    Connecting,
    Syncing,
    Synced,
    Reconnecting,
    Dropped,
    /// Terminal until the page is reloaded or navigated away from
    Desynced,
}

/// Board and thread the session follows. Thread zero is a board page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub board: String,
    pub thread: PostId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Opened,
    Frame(String),
    Closed,
    RetryTimer,
    AttemptReset,
    BacklogDone { generation: u64, result: Result<Vec<String>, String> },
    Foreground { transport_alive: bool },
    Online,
    Offline,
    Navigate(Page),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    Send(String),
    ScheduleRetry(Duration),
    ScheduleAttemptReset(Duration),
    CancelTimers,
    FetchBacklog { generation: u64, thread: PostId, start: u64, end: u64 },
    Status(ConnState),
}

/// `500ms * 1.5^min(attempts / 2, 12)`, topping out a little over a minute.
pub fn retry_delay(attempts: u32) -> Duration {
    let exp = (attempts / 2).min(MAX_RETRY_EXPONENT);
    Duration::from_millis((BASE_RETRY_MS * 1.5f64.powi(exp as i32)) as u64)
}

/// Client connection state machine. Owns the local thread model and every retry counter;
/// performs no I/O itself.
#[derive(Debug)]
pub struct ConnectionSession {
    state: ConnState,
    page: Page,
    attempts: u32,
    /// Bumped on every teardown; backlog results from older generations are dropped
    generation: u64,
    last: u64,
    /// Server's log length from the sync ack
    target: Option<u64>,
    pending: BTreeMap<u64, Replicated>,
    fetching: Option<(u64, u64)>,
    model: ThreadModel,
    desync_reason: Option<String>,
    pub online: usize,
    pub server_time: Option<i64>,
    pub assigned_id: Option<PostId>,
    pub reclaimed: Option<bool>,
    pub rejections: Vec<Rejection>,
    pub notifications: Vec<String>,
}

impl ConnectionSession {
    pub fn new(page: Page) -> Self {
        let model = ThreadModel::new(page.thread);
        Self {
            state: ConnState::Loading,
            page,
            attempts: 0,
            generation: 0,
            last: 0,
            target: None,
            pending: BTreeMap::new(),
            fetching: None,
            model,
            desync_reason: None,
            online: 0,
            server_time: None,
            assigned_id: None,
            reclaimed: None,
            rejections: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last applied seq of the followed thread.
    pub fn last_seq(&self) -> u64 {
        self.last
    }

    pub fn model(&self) -> &ThreadModel {
        &self.model
    }

    pub fn desync_reason(&self) -> Option<&str> {
        self.desync_reason.as_deref()
    }

    /// Frame for an outbound request, if the session is in a state that may send.
    pub fn send(&self, msg: &ClientMessage) -> Option<Effect> {
        if !matches!(self.state, ConnState::Syncing | ConnState::Synced) {
            return None;
        }
        match msg.encode() {
            Ok(frame) => Some(Effect::Send(frame)),
            Err(e) => {
                warn!(error = %e, "dropping unencodable client message");
                None
            }
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::Start => {
                if self.state == ConnState::Loading {
                    self.attempts = 0;
                    self.enter(ConnState::Connecting, &mut fx);
                    fx.push(Effect::OpenTransport);
                }
            }
            Event::Opened => {
                if matches!(self.state, ConnState::Connecting | ConnState::Reconnecting) {
                    self.begin_sync(&mut fx);
                }
            }
            Event::Frame(raw) => {
                if matches!(self.state, ConnState::Syncing | ConnState::Synced) {
                    match ServerMessage::decode(&raw) {
                        Ok(msg) => self.on_message(msg, &mut fx),
                        Err(e) => self.desync(e.to_string(), &mut fx),
                    }
                }
            }
            Event::Closed => self.drop_connection(false, &mut fx),
            Event::RetryTimer => {
                if self.state == ConnState::Dropped {
                    self.reconnect(&mut fx);
                }
            }
            Event::AttemptReset => self.attempts = 0,
            Event::BacklogDone { generation, result } => self.on_backlog(generation, result, &mut fx),
            Event::Foreground { transport_alive } => match self.state {
                ConnState::Desynced => {}
                ConnState::Synced | ConnState::Syncing | ConnState::Connecting if !transport_alive => {
                    self.drop_connection(true, &mut fx)
                }
                ConnState::Synced => fx.extend(self.send(&ClientMessage::NoOp)),
                ConnState::Dropped => {
                    fx.push(Effect::CancelTimers);
                    self.reconnect(&mut fx);
                }
                _ => {}
            },
            Event::Online => {
                self.attempts = 0;
                if self.state == ConnState::Dropped {
                    fx.push(Effect::CancelTimers);
                    self.reconnect(&mut fx);
                }
            }
            Event::Offline => {
                if !matches!(self.state, ConnState::Loading | ConnState::Dropped | ConnState::Desynced) {
                    self.drop_connection(true, &mut fx);
                }
            }
            Event::Navigate(page) => self.navigate(page, &mut fx),
        }
        fx
    }

    fn enter(&mut self, state: ConnState, fx: &mut Vec<Effect>) {
        debug!(from = ?self.state, to = ?state, "connection state");
        self.state = state;
        fx.push(Effect::Status(state));
    }

    fn begin_sync(&mut self, fx: &mut Vec<Effect>) {
        self.enter(ConnState::Syncing, fx);
        self.target = None;
        let mut ctr = BTreeMap::new();
        if self.page.thread != 0 {
            ctr.insert(self.page.thread, self.last);
        }
        let req = ClientMessage::Synchronize(SyncRequest { board: self.page.board.clone(), thread: self.page.thread, ctr });
        match req.encode() {
            Ok(frame) => fx.push(Effect::Send(frame)),
            Err(e) => self.desync(e.to_string(), fx),
        }
    }

    fn reconnect(&mut self, fx: &mut Vec<Effect>) {
        self.enter(ConnState::Reconnecting, fx);
        fx.push(Effect::OpenTransport);
    }

    /// Tears down per-connection state. The thread model and `last` survive for the resync.
    fn reset_connection(&mut self) {
        self.generation += 1;
        self.target = None;
        self.fetching = None;
        self.pending.clear();
    }

    fn drop_connection(&mut self, close_transport: bool, fx: &mut Vec<Effect>) {
        if self.state == ConnState::Desynced {
            return;
        }
        self.reset_connection();
        fx.push(Effect::CancelTimers);
        if close_transport {
            fx.push(Effect::CloseTransport);
        }
        self.enter(ConnState::Dropped, fx);
        self.attempts += 1;
        let wait = retry_delay(self.attempts);
        debug!(attempts = self.attempts, wait_ms = wait.as_millis() as u64, "scheduling reconnect");
        fx.push(Effect::ScheduleRetry(wait));
    }

    fn desync(&mut self, reason: String, fx: &mut Vec<Effect>) {
        warn!(reason = %reason, thread = self.page.thread, "out of sync");
        self.reset_connection();
        self.desync_reason = Some(reason);
        fx.push(Effect::CancelTimers);
        fx.push(Effect::CloseTransport);
        self.enter(ConnState::Desynced, fx);
    }

    fn navigate(&mut self, page: Page, fx: &mut Vec<Effect>) {
        info!(board = %page.board, thread = page.thread, "navigating");
        let live = self.state != ConnState::Loading;
        self.reset_connection();
        self.model = ThreadModel::new(page.thread);
        self.page = page;
        self.last = 0;
        self.attempts = 0;
        self.desync_reason = None;
        self.online = 0;
        self.assigned_id = None;
        self.reclaimed = None;
        if !live {
            return;
        }
        fx.push(Effect::CancelTimers);
        fx.push(Effect::CloseTransport);
        self.enter(ConnState::Connecting, fx);
        fx.push(Effect::OpenTransport);
    }

    fn on_message(&mut self, msg: ServerMessage, fx: &mut Vec<Effect>) {
        match msg {
            ServerMessage::Concat(parts) => {
                for part in parts {
                    if self.state == ConnState::Desynced {
                        return;
                    }
                    self.on_message(part, fx);
                }
            }
            ServerMessage::Invalid(reason) => self.desync(reason, fx),
            ServerMessage::Synchronize(ack) => self.on_ack(ack, fx),
            ServerMessage::Update(rep) => {
                if rep.thread == self.page.thread {
                    self.on_update(rep, fx);
                }
            }
            ServerMessage::Redirect(Redirect { board, thread, .. }) => self.navigate(Page { board, thread }, fx),
            ServerMessage::Reject(r) => {
                debug!(tag = r.tag, error = %r.error, "request rejected");
                self.rejections.push(r);
            }
            ServerMessage::PostId(id) => self.assigned_id = Some(id),
            ServerMessage::Reclaim(code) => self.reclaimed = Some(code == 0),
            ServerMessage::SyncCount(n) => self.online = n,
            ServerMessage::ServerTime(ms) => self.server_time = Some(ms),
            ServerMessage::Notification(text) => self.notifications.push(text),
            ServerMessage::NoOp => {}
        }
    }

    fn on_ack(&mut self, ack: SyncAck, fx: &mut Vec<Effect>) {
        if self.state != ConnState::Syncing {
            return self.desync("unexpected synchronisation".into(), fx);
        }
        if ack.ctr < self.last {
            return self.desync(format!("server at {} behind client at {}", ack.ctr, self.last), fx);
        }
        self.target = Some(ack.ctr);
        if !ack.replay && ack.ctr > self.last {
            self.request_backlog(self.last + 1, ack.ctr + 1, fx);
        }
        self.check_synced(fx);
    }

    fn on_update(&mut self, rep: Replicated, fx: &mut Vec<Effect>) {
        if rep.seq <= self.last {
            return;
        }
        if rep.seq > self.last + 1 {
            let seq = rep.seq;
            self.pending.insert(seq, rep);
            if self.fetching.is_none() && self.state == ConnState::Synced {
                self.request_backlog(self.last + 1, seq, fx);
            }
            return;
        }
        if !self.apply(rep, fx) {
            return;
        }
        self.drain_pending(fx);
        self.check_synced(fx);
    }

    /// Applies the next in-order entry. Returns false once the session desynced.
    fn apply(&mut self, rep: Replicated, fx: &mut Vec<Effect>) -> bool {
        match self.model.apply(&rep.update) {
            Ok(()) => {
                self.last = rep.seq;
                true
            }
            Err(e) => {
                self.desync(format!("seq {}: {e}", rep.seq), fx);
                false
            }
        }
    }

    fn drain_pending(&mut self, fx: &mut Vec<Effect>) {
        while let Some(entry) = self.pending.first_entry() {
            let seq = *entry.key();
            if seq <= self.last {
                entry.remove();
                continue;
            }
            if seq != self.last + 1 {
                break;
            }
            let rep = entry.remove();
            if !self.apply(rep, fx) {
                return;
            }
        }
    }

    fn request_backlog(&mut self, start: u64, end: u64, fx: &mut Vec<Effect>) {
        self.fetching = Some((start, end));
        fx.push(Effect::FetchBacklog { generation: self.generation, thread: self.page.thread, start, end });
    }

    fn on_backlog(&mut self, generation: u64, result: Result<Vec<String>, String>, fx: &mut Vec<Effect>) {
        if generation != self.generation || self.fetching.is_none() {
            debug!(generation, current = self.generation, "discarding stale backlog");
            return;
        }
        self.fetching = None;
        let frames = match result {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "backlog fetch failed");
                return self.drop_connection(true, fx);
            }
        };
        let before = self.last;
        for raw in frames {
            match ServerMessage::decode(&raw) {
                Ok(ServerMessage::Update(rep)) if rep.thread == self.page.thread => {
                    if rep.seq > self.last {
                        self.pending.insert(rep.seq, rep);
                    }
                }
                Ok(other) => return self.desync(format!("unexpected backlog frame {}", other.kind() as u8), fx),
                Err(e) => return self.desync(e.to_string(), fx),
            }
        }
        self.drain_pending(fx);
        if self.state == ConnState::Desynced {
            return;
        }
        if let Some(&next) = self.pending.keys().next() {
            if self.last == before {
                return self.desync(format!("backlog did not cover seq {}", self.last + 1), fx);
            }
            self.request_backlog(self.last + 1, next, fx);
            return;
        }
        if let Some(target) = self.target {
            if self.last < target {
                if self.last == before {
                    return self.desync(format!("backlog did not reach seq {target}"), fx);
                }
                self.request_backlog(self.last + 1, target + 1, fx);
                return;
            }
        }
        self.check_synced(fx);
    }

    fn check_synced(&mut self, fx: &mut Vec<Effect>) {
        if self.state != ConnState::Syncing || self.fetching.is_some() {
            return;
        }
        let Some(target) = self.target else { return };
        if self.last < target {
            return;
        }
        if let Some(&next) = self.pending.keys().next() {
            return self.request_backlog(self.last + 1, next, fx);
        }
        self.enter(ConnState::Synced, fx);
        fx.push(Effect::ScheduleAttemptReset(ATTEMPT_RESET));
    }
}
