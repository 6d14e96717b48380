//! Wire protocol shared by the server router and the client session.
//!
//! A frame is a two-digit decimal type tag followed by a JSON payload. Tags
//! below 30 carry replicated thread updates and advance the thread's `seq`;
//! tags from 30 up are control messages. Frames of type `concat` hold several
//! complete sub-frames separated by `\u0000`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::models::{Image, Post, PostId, Segment};

pub const FRAME_SEPARATOR: char = '\u{0000}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invalid = 0,
    InsertThread = 1,
    InsertPost = 2,
    AppendBody = 3,
    Backspace = 4,
    SpliceBody = 5,
    ClosePost = 6,
    Backlink = 7,
    InsertImage = 8,
    SpoilerImage = 9,
    DeletePost = 10,
    Ban = 11,
    LockThread = 12,
    Synchronize = 30,
    Reclaim = 31,
    PostId = 32,
    Concat = 33,
    NoOp = 34,
    SyncCount = 35,
    ServerTime = 36,
    Redirect = 37,
    Notification = 38,
    Reject = 39,
}

impl MessageType {
    /// Thread-mutating messages that occupy a slot in the replication log.
    pub fn is_replicated(self) -> bool {
        let tag = self as u8;
        tag > 0 && tag < 30
    }

    fn update_kind(self) -> &'static str {
        match self {
            MessageType::InsertThread => "insertThread",
            MessageType::InsertPost => "insertPost",
            MessageType::AppendBody => "appendBody",
            MessageType::Backspace => "backspace",
            MessageType::SpliceBody => "spliceBody",
            MessageType::ClosePost => "closePost",
            MessageType::Backlink => "backlink",
            MessageType::InsertImage => "insertImage",
            MessageType::SpoilerImage => "spoilerImage",
            MessageType::DeletePost => "deletePost",
            MessageType::Ban => "ban",
            MessageType::LockThread => "lockThread",
            _ => "",
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        use MessageType::*;
        Ok(match tag {
            0 => Invalid,
            1 => InsertThread,
            2 => InsertPost,
            3 => AppendBody,
            4 => Backspace,
            5 => SpliceBody,
            6 => ClosePost,
            7 => Backlink,
            8 => InsertImage,
            9 => SpoilerImage,
            10 => DeletePost,
            11 => Ban,
            12 => LockThread,
            30 => Synchronize,
            31 => Reclaim,
            32 => PostId,
            33 => Concat,
            34 => NoOp,
            35 => SyncCount,
            36 => ServerTime,
            37 => Redirect,
            38 => Notification,
            39 => Reject,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

/// Canonical post-model mutation. One of these occupies each replication log slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Update {
    InsertThread(Post),
    InsertPost(Post),
    AppendBody { id: PostId, text: String },
    Backspace { id: PostId },
    SpliceBody { id: PostId, start: usize, len: usize, text: String },
    ClosePost { id: PostId, body: Vec<Segment> },
    /// `id` gained a backlink from `by`, which lives in `by_thread`
    Backlink { id: PostId, by: PostId, by_thread: PostId, board: String },
    InsertImage { id: PostId, image: Image },
    SpoilerImage { id: PostId },
    DeletePost { id: PostId },
    Ban { id: PostId },
    LockThread { locked: bool },
}

impl Update {
    pub fn kind(&self) -> MessageType {
        match self {
            Update::InsertThread(_) => MessageType::InsertThread,
            Update::InsertPost(_) => MessageType::InsertPost,
            Update::AppendBody { .. } => MessageType::AppendBody,
            Update::Backspace { .. } => MessageType::Backspace,
            Update::SpliceBody { .. } => MessageType::SpliceBody,
            Update::ClosePost { .. } => MessageType::ClosePost,
            Update::Backlink { .. } => MessageType::Backlink,
            Update::InsertImage { .. } => MessageType::InsertImage,
            Update::SpoilerImage { .. } => MessageType::SpoilerImage,
            Update::DeletePost { .. } => MessageType::DeletePost,
            Update::Ban { .. } => MessageType::Ban,
            Update::LockThread { .. } => MessageType::LockThread,
        }
    }

    /// Post the update is addressed to, if any.
    pub fn target(&self) -> Option<PostId> {
        match self {
            Update::InsertThread(p) | Update::InsertPost(p) => Some(p.id),
            Update::AppendBody { id, .. }
            | Update::Backspace { id }
            | Update::SpliceBody { id, .. }
            | Update::ClosePost { id, .. }
            | Update::Backlink { id, .. }
            | Update::InsertImage { id, .. }
            | Update::SpoilerImage { id }
            | Update::DeletePost { id }
            | Update::Ban { id } => Some(*id),
            Update::LockThread { .. } => None,
        }
    }

    fn data(&self) -> Result<Value, ProtocolError> {
        let mut v = serde_json::to_value(self).map_err(ProtocolError::Encode)?;
        Ok(v.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }

    fn from_data(kind: MessageType, data: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(json!({ "kind": kind.update_kind(), "data": data }))
            .map_err(|source| ProtocolError::Payload { tag: kind as u8, source })
    }
}

/// Replicated update as sent on the wire and stored in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replicated {
    pub seq: u64,
    pub thread: PostId,
    pub update: Update,
    /// Poster IP, moderators only
    pub ip: Option<String>,
    /// Hashed poster hint, janitors only
    pub hint: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ReplicatedWire {
    seq: u64,
    thread: PostId,
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl Replicated {
    pub fn new(seq: u64, thread: PostId, update: Update) -> Self {
        Self { seq, thread, update, ip: None, hint: None }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let wire = ReplicatedWire {
            seq: self.seq,
            thread: self.thread,
            data: self.update.data()?,
            ip: self.ip.clone(),
            hint: self.hint.clone(),
        };
        frame(self.update.kind(), &wire)
    }

    fn decode(kind: MessageType, rest: &str) -> Result<Self, ProtocolError> {
        let wire: ReplicatedWire = payload(kind, rest)?;
        Ok(Self {
            seq: wire.seq,
            thread: wire.thread,
            update: Update::from_data(kind, wire.data)?,
            ip: wire.ip,
            hint: wire.hint,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub board: String,
    /// Zero for a board page
    #[serde(default)]
    pub thread: PostId,
    /// Last seen seq per thread
    #[serde(default, alias = "lastSeq")]
    pub ctr: BTreeMap<PostId, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    /// Server's current log length for the thread
    pub ctr: u64,
    /// Missed entries follow inline; otherwise the client fetches the backlog
    pub replay: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewThread {
    pub subject: Option<String>,
    #[serde(flatten)]
    pub post: NewPost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPost {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub body: String,
    /// Upload token returned by the image pipeline
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub sage: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    pub board: String,
    pub thread: PostId,
    pub id: PostId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Tag of the request being rejected
    pub tag: u8,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRequest {
    pub id: PostId,
    #[serde(default)]
    pub reason: String,
    /// Seconds
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimRequest {
    pub id: PostId,
    pub password: String,
}

/// Messages a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Synchronize(SyncRequest),
    InsertThread(NewThread),
    InsertPost(NewPost),
    AppendBody(String),
    Backspace,
    SpliceBody { start: usize, len: usize, text: String },
    ClosePost,
    InsertImage(String),
    SpoilerImage(PostId),
    DeletePost(PostId),
    Ban(BanRequest),
    LockThread(bool),
    Reclaim(ReclaimRequest),
    NoOp,
    Concat(Vec<ClientMessage>),
}

#[derive(Serialize, Deserialize)]
struct SpliceWire {
    start: usize,
    len: usize,
    text: String,
}

#[derive(Serialize, Deserialize)]
struct IdWire {
    id: PostId,
}

impl ClientMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            ClientMessage::Synchronize(_) => MessageType::Synchronize,
            ClientMessage::InsertThread(_) => MessageType::InsertThread,
            ClientMessage::InsertPost(_) => MessageType::InsertPost,
            ClientMessage::AppendBody(_) => MessageType::AppendBody,
            ClientMessage::Backspace => MessageType::Backspace,
            ClientMessage::SpliceBody { .. } => MessageType::SpliceBody,
            ClientMessage::ClosePost => MessageType::ClosePost,
            ClientMessage::InsertImage(_) => MessageType::InsertImage,
            ClientMessage::SpoilerImage(_) => MessageType::SpoilerImage,
            ClientMessage::DeletePost(_) => MessageType::DeletePost,
            ClientMessage::Ban(_) => MessageType::Ban,
            ClientMessage::LockThread(_) => MessageType::LockThread,
            ClientMessage::Reclaim(_) => MessageType::Reclaim,
            ClientMessage::NoOp => MessageType::NoOp,
            ClientMessage::Concat(_) => MessageType::Concat,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.kind();
        match self {
            ClientMessage::Synchronize(req) => frame(kind, req),
            ClientMessage::InsertThread(t) => frame(kind, t),
            ClientMessage::InsertPost(p) => frame(kind, p),
            ClientMessage::AppendBody(text) => frame(kind, text),
            ClientMessage::Backspace | ClientMessage::ClosePost | ClientMessage::NoOp => {
                Ok(bare(kind))
            }
            ClientMessage::SpliceBody { start, len, text } => {
                frame(kind, &SpliceWire { start: *start, len: *len, text: text.clone() })
            }
            ClientMessage::InsertImage(token) => frame(kind, token),
            ClientMessage::SpoilerImage(id) | ClientMessage::DeletePost(id) => {
                frame(kind, &IdWire { id: *id })
            }
            ClientMessage::Ban(req) => frame(kind, req),
            ClientMessage::LockThread(locked) => frame(kind, locked),
            ClientMessage::Reclaim(req) => frame(kind, req),
            ClientMessage::Concat(parts) => concat(parts.iter().map(ClientMessage::encode)),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let (kind, rest) = split_frame(raw)?;
        Ok(match kind {
            MessageType::Synchronize => ClientMessage::Synchronize(payload(kind, rest)?),
            MessageType::InsertThread => ClientMessage::InsertThread(payload(kind, rest)?),
            MessageType::InsertPost => ClientMessage::InsertPost(payload(kind, rest)?),
            MessageType::AppendBody => ClientMessage::AppendBody(payload(kind, rest)?),
            MessageType::Backspace => ClientMessage::Backspace,
            MessageType::SpliceBody => {
                let w: SpliceWire = payload(kind, rest)?;
                ClientMessage::SpliceBody { start: w.start, len: w.len, text: w.text }
            }
            MessageType::ClosePost => ClientMessage::ClosePost,
            MessageType::InsertImage => ClientMessage::InsertImage(payload(kind, rest)?),
            MessageType::SpoilerImage => {
                ClientMessage::SpoilerImage(payload::<IdWire>(kind, rest)?.id)
            }
            MessageType::DeletePost => ClientMessage::DeletePost(payload::<IdWire>(kind, rest)?.id),
            MessageType::Ban => ClientMessage::Ban(payload(kind, rest)?),
            MessageType::LockThread => ClientMessage::LockThread(payload(kind, rest)?),
            MessageType::Reclaim => ClientMessage::Reclaim(payload(kind, rest)?),
            MessageType::NoOp => ClientMessage::NoOp,
            MessageType::Concat => {
                let parts = split_concat(rest)
                    .map(ClientMessage::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                if parts.iter().any(|p| matches!(p, ClientMessage::Concat(_))) {
                    return Err(ProtocolError::NestedConcat);
                }
                ClientMessage::Concat(parts)
            }
            other => return Err(ProtocolError::Unexpected(other as u8)),
        })
    }
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Invalid(String),
    Update(Replicated),
    Synchronize(SyncAck),
    /// 0 = reclaimed, 1 = refused
    Reclaim(u8),
    PostId(PostId),
    Concat(Vec<ServerMessage>),
    NoOp,
    SyncCount(usize),
    /// Unix milliseconds
    ServerTime(i64),
    Redirect(Redirect),
    Notification(String),
    Reject(Rejection),
}

impl ServerMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            ServerMessage::Invalid(_) => MessageType::Invalid,
            ServerMessage::Update(r) => r.update.kind(),
            ServerMessage::Synchronize(_) => MessageType::Synchronize,
            ServerMessage::Reclaim(_) => MessageType::Reclaim,
            ServerMessage::PostId(_) => MessageType::PostId,
            ServerMessage::Concat(_) => MessageType::Concat,
            ServerMessage::NoOp => MessageType::NoOp,
            ServerMessage::SyncCount(_) => MessageType::SyncCount,
            ServerMessage::ServerTime(_) => MessageType::ServerTime,
            ServerMessage::Redirect(_) => MessageType::Redirect,
            ServerMessage::Notification(_) => MessageType::Notification,
            ServerMessage::Reject(_) => MessageType::Reject,
        }
    }

    pub fn reject(tag: MessageType, error: impl Into<String>) -> Self {
        ServerMessage::Reject(Rejection { tag: tag as u8, error: error.into() })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let kind = self.kind();
        match self {
            ServerMessage::Invalid(msg) => frame(kind, msg),
            ServerMessage::Update(r) => r.encode(),
            ServerMessage::Synchronize(ack) => frame(kind, ack),
            ServerMessage::Reclaim(code) => frame(kind, code),
            ServerMessage::PostId(id) => frame(kind, id),
            ServerMessage::Concat(parts) => concat(parts.iter().map(ServerMessage::encode)),
            ServerMessage::NoOp => Ok(bare(kind)),
            ServerMessage::SyncCount(n) => frame(kind, n),
            ServerMessage::ServerTime(ms) => frame(kind, ms),
            ServerMessage::Redirect(r) => frame(kind, r),
            ServerMessage::Notification(text) => frame(kind, text),
            ServerMessage::Reject(r) => frame(kind, r),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let (kind, rest) = split_frame(raw)?;
        if kind.is_replicated() {
            return Ok(ServerMessage::Update(Replicated::decode(kind, rest)?));
        }
        Ok(match kind {
            MessageType::Invalid => ServerMessage::Invalid(payload(kind, rest)?),
            MessageType::Synchronize => ServerMessage::Synchronize(payload(kind, rest)?),
            MessageType::Reclaim => ServerMessage::Reclaim(payload(kind, rest)?),
            MessageType::PostId => ServerMessage::PostId(payload(kind, rest)?),
            MessageType::Concat => {
                let parts = split_concat(rest)
                    .map(ServerMessage::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                if parts.iter().any(|p| matches!(p, ServerMessage::Concat(_))) {
                    return Err(ProtocolError::NestedConcat);
                }
                ServerMessage::Concat(parts)
            }
            MessageType::NoOp => ServerMessage::NoOp,
            MessageType::SyncCount => ServerMessage::SyncCount(payload(kind, rest)?),
            MessageType::ServerTime => ServerMessage::ServerTime(payload(kind, rest)?),
            MessageType::Redirect => ServerMessage::Redirect(payload(kind, rest)?),
            MessageType::Notification => ServerMessage::Notification(payload(kind, rest)?),
            MessageType::Reject => ServerMessage::Reject(payload(kind, rest)?),
            other => return Err(ProtocolError::Unexpected(other as u8)),
        })
    }
}

/// Split a frame into its type and raw payload.
pub fn split_frame(raw: &str) -> Result<(MessageType, &str), ProtocolError> {
    let bytes = raw.as_bytes();
    if bytes.len() < 2 || !bytes[0].is_ascii_digit() || !bytes[1].is_ascii_digit() {
        return Err(ProtocolError::BadFrame);
    }
    let tag = (bytes[0] - b'0') * 10 + (bytes[1] - b'0');
    Ok((MessageType::try_from(tag)?, &raw[2..]))
}

fn split_concat(rest: &str) -> impl Iterator<Item = &str> {
    rest.split(FRAME_SEPARATOR).filter(|s| !s.is_empty())
}

fn frame<T: Serialize + ?Sized>(kind: MessageType, payload: &T) -> Result<String, ProtocolError> {
    let body = serde_json::to_string(payload).map_err(ProtocolError::Encode)?;
    Ok(format!("{:02}{}", kind as u8, body))
}

fn bare(kind: MessageType) -> String {
    format!("{:02}", kind as u8)
}

fn concat(parts: impl Iterator<Item = Result<String, ProtocolError>>) -> Result<String, ProtocolError> {
    let parts = parts.collect::<Result<Vec<_>, _>>()?;
    let mut out = bare(MessageType::Concat);
    out.push_str(&parts.join(&FRAME_SEPARATOR.to_string()));
    Ok(out)
}

fn payload<T: DeserializeOwned>(kind: MessageType, rest: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(rest).map_err(|source| ProtocolError::Payload { tag: kind as u8, source })
}
