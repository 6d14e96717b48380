use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::error::{PostError, ProtocolError};
use crate::fanout::{FanoutError, Listener, Outbox, SessionId};
use crate::models::{Identity, PostId};
use crate::protocol::{ClientMessage, MessageType, NewPost, NewThread, Redirect, ServerMessage, SyncAck, SyncRequest};
use crate::services::Services;
use crate::writer::OpenPost;

/// What the transport should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close without `invalid`; the client will reconnect
    Close,
}

/// Server side of one connection.
pub struct ClientSession {
    pub id: SessionId,
    pub identity: Identity,
    services: Arc<Services>,
    outbox: Outbox,
    board: Option<String>,
    thread: PostId,
    synced: bool,
    open: Option<OpenPost>,
}

impl ClientSession {
    pub fn new(services: Arc<Services>, identity: Identity, outbox: Outbox) -> Self {
        let id = services.sessions.register(outbox.clone());
        Self { id, identity, services, outbox, board: None, thread: 0, synced: false, open: None }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn thread(&self) -> PostId {
        self.thread
    }

    pub fn open_post(&self) -> Option<&OpenPost> {
        self.open.as_ref()
    }

    /// Decodes and dispatches one inbound frame. An error means the session must be
    /// told `invalid` and disconnected.
    pub async fn handle_frame(&mut self, raw: &str) -> Result<Flow, ProtocolError> {
        match ClientMessage::decode(raw)? {
            ClientMessage::Concat(parts) => {
                for msg in parts {
                    if self.handle(msg).await? == Flow::Close {
                        return Ok(Flow::Close);
                    }
                }
                Ok(Flow::Continue)
            }
            msg => self.handle(msg).await,
        }
    }

    async fn handle(&mut self, msg: ClientMessage) -> Result<Flow, ProtocolError> {
        let kind = msg.kind();
        if !self.synced && kind != MessageType::Synchronize {
            return Err(ProtocolError::NotSynced);
        }
        let result = match msg {
            ClientMessage::Synchronize(req) => return self.synchronize(req).await,
            ClientMessage::NoOp => {
                self.send(&ServerMessage::NoOp);
                Ok(())
            }
            ClientMessage::Reclaim(req) => {
                let had_open = self.open.is_some();
                let code = match self.services.writer.reclaim(req.id, &req.password).await {
                    Ok(open) if !had_open && open.thread == self.thread => {
                        self.open = Some(open);
                        0
                    }
                    _ => 1,
                };
                self.send(&ServerMessage::Reclaim(code));
                Ok(())
            }
            ClientMessage::InsertThread(req) => self.insert_thread(req).await,
            ClientMessage::InsertPost(req) => self.insert_post(req).await,
            ClientMessage::AppendBody(text) => match &self.open {
                Some(open) => self.services.writer.append_body(open, &text).await,
                None => Err(PostError::NoOpenPost),
            },
            ClientMessage::Backspace => match &self.open {
                Some(open) => self.services.writer.backspace(open).await,
                None => Err(PostError::NoOpenPost),
            },
            ClientMessage::SpliceBody { start, len, text } => match &self.open {
                Some(open) => self.services.writer.splice_body(open, start, len, &text).await,
                None => Err(PostError::NoOpenPost),
            },
            ClientMessage::ClosePost => match self.open.take() {
                Some(open) => self.services.writer.close_post(&open).await,
                None => Err(PostError::NoOpenPost),
            },
            ClientMessage::InsertImage(token) => match &self.open {
                Some(open) => self.services.writer.insert_image(open, &token).await,
                None => Err(PostError::NoOpenPost),
            },
            ClientMessage::SpoilerImage(id) => self.services.writer.spoiler_image(&self.identity, id).await,
            ClientMessage::DeletePost(id) => self.services.writer.delete_post(&self.identity, id).await,
            ClientMessage::Ban(req) => self.services.writer.ban(&self.identity, &req).await,
            ClientMessage::LockThread(locked) => match self.thread {
                0 => Err(PostError::NoThread),
                thread => self.services.writer.lock_thread(&self.identity, thread, locked).await,
            },
            ClientMessage::Concat(_) => return Err(ProtocolError::NestedConcat),
        };
        if let Err(e) = result {
            self.reject(kind, e);
        }
        Ok(Flow::Continue)
    }

    async fn synchronize(&mut self, req: SyncRequest) -> Result<Flow, ProtocolError> {
        if !self.services.cfg.is_board(&req.board) {
            return Err(ProtocolError::InvalidBoard);
        }
        if self.synced && self.thread != 0 {
            self.services.fanout.unlisten(self.thread, self.id).await;
        }
        self.synced = false;
        self.open = None;

        if req.thread != 0 {
            let Some(parent) = self.services.cache.get(req.thread) else {
                return Err(ProtocolError::Other(format!("thread {} does not exist", req.thread)));
            };
            if parent.thread != req.thread || parent.board != req.board {
                self.send(&ServerMessage::Redirect(Redirect {
                    board: parent.board,
                    thread: parent.thread,
                    id: req.thread,
                }));
                return Ok(Flow::Continue);
            }
            let last = req.ctr.get(&req.thread).copied().unwrap_or(0);
            let listener = Listener {
                session: self.id,
                ip: self.identity.ip.clone(),
                tier: self.identity.tier,
                outbox: self.outbox.clone(),
            };
            match self.services.fanout.listen(req.thread, listener, last).await {
                Ok(ack) => debug!(session = self.id, thread = req.thread, last, ctr = ack.ctr, "synchronised"),
                Err(FanoutError::InvalidCounter) => return Err(ProtocolError::InvalidCounter),
                Err(FanoutError::Protocol(e)) => return Err(e),
                Err(FanoutError::Store(e)) => {
                    error!(session = self.id, thread = req.thread, error = %e, "sync failed");
                    self.send(&ServerMessage::reject(MessageType::Synchronize, "try again"));
                    return Ok(Flow::Close);
                }
            }
        } else {
            self.send(&ServerMessage::Synchronize(SyncAck { ctr: 0, replay: true }));
        }

        self.board = Some(req.board);
        self.thread = req.thread;
        self.synced = true;
        self.send(&ServerMessage::ServerTime(Utc::now().timestamp_millis()));
        Ok(Flow::Continue)
    }

    async fn insert_thread(&mut self, req: NewThread) -> Result<(), PostError> {
        if self.open.is_some() {
            return Err(PostError::AlreadyOpen);
        }
        let board = self.board.clone().unwrap_or_default();
        let outbox = self.outbox.clone();
        let inserted = self
            .services
            .writer
            .insert_thread(&self.identity, &board, req, move |id| send_to(&outbox, &ServerMessage::PostId(id)))
            .await?;
        if inserted.post.editing {
            self.open = Some(OpenPost { id: inserted.post.id, thread: inserted.post.thread, board });
        }
        Ok(())
    }

    async fn insert_post(&mut self, req: NewPost) -> Result<(), PostError> {
        if self.thread == 0 {
            return Err(PostError::NoThread);
        }
        if self.open.is_some() {
            return Err(PostError::AlreadyOpen);
        }
        let board = self.board.clone().unwrap_or_default();
        let outbox = self.outbox.clone();
        let inserted = self
            .services
            .writer
            .insert_post(&self.identity, &board, self.thread, req, move |id| {
                send_to(&outbox, &ServerMessage::PostId(id))
            })
            .await?;
        if inserted.post.editing {
            self.open = Some(OpenPost { id: inserted.post.id, thread: self.thread, board });
        }
        Ok(())
    }

    fn reject(&self, kind: MessageType, e: PostError) {
        metrics::counter!("rib_rejections_total", "reason" => e.label()).increment(1);
        if let PostError::Infrastructure(detail) = &e {
            error!(session = self.id, tag = kind as u8, error = %detail, "request failed");
        } else {
            debug!(session = self.id, tag = kind as u8, error = %e, "request rejected");
        }
        self.send(&ServerMessage::reject(kind, e.to_string()));
    }

    fn send(&self, msg: &ServerMessage) {
        send_to(&self.outbox, msg);
    }

    /// Leaves the thread fanout and the session registry. The open post stays open for reclaim.
    pub async fn close(&mut self) {
        if self.synced && self.thread != 0 {
            self.services.fanout.unlisten(self.thread, self.id).await;
        }
        self.synced = false;
        self.services.sessions.remove(self.id);
    }
}

fn send_to(outbox: &Outbox, msg: &ServerMessage) {
    match msg.encode() {
        Ok(frame) => {
            let _ = outbox.send(frame.into());
        }
        Err(e) => warn!(error = %e, "failed to encode server message"),
    }
}
