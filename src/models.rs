use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::protocol::Update;

/// Global post number. Threads share the space with replies.
pub type PostId = u64;

/// Access level of a connected session. Ordered so that `Moderator > Janitor > Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Normal,
    Janitor,
    Moderator,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Normal, Tier::Janitor, Tier::Moderator];

    pub fn at_least(self, other: Tier) -> bool {
        self >= other
    }
}

/// Already-resolved identity of a connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub ip: String,
    pub tier: Tier,
    /// Staff subject from the session token, shown as the post's auth title
    pub staff: Option<String>,
}

impl Identity {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self { ip: ip.into(), tier: Tier::Normal, staff: None }
    }

    pub fn staff(ip: impl Into<String>, tier: Tier, subject: impl Into<String>) -> Self {
        Self { ip: ip.into(), tier, staff: Some(subject.into()) }
    }
}

/// Confirmed `>>N` reply link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Link {
    pub id: PostId,
    pub thread: PostId,
    pub board: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DiceRoll {
    pub count: u8,
    pub faces: u16,
    #[serde(default)]
    pub bias: i16,
    pub rolls: Vec<u16>,
}

/// Hash command with its server-side result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "val", rename_all = "snake_case")]
pub enum Command {
    Flip(bool),
    EightBall(String),
    Dice(DiceRoll),
}

/// One run of a parsed post body. Text runs are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum Segment {
    Text(String),
    Link { link: Link },
    Command { command: Command },
}

/// Thumbnail size class the image pipeline produced the upload for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ThumbClass {
    Thread,
    Reply,
}

/// Image as embedded in a post and sent to clients. Never carries the content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Image {
    pub name: String,
    pub mime: String,
    pub size: u64,
    /// width, height, thumbnail width, thumbnail height
    pub dims: [u32; 4],
    pub src: String,
    pub thumb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub spoiler: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Src,
    Thumb,
    Mid,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Src => "src",
            FileKind::Thumb => "thumb",
            FileKind::Mid => "mid",
        }
    }
}

/// Processed upload file waiting in temporary storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TempFile {
    pub kind: FileKind,
    pub tmp: String,
    pub name: String,
}

/// What the external image pipeline deposits under an upload token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ImageDescriptor {
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub dims: [u32; 4],
    pub hash: String,
    pub class: ThumbClass,
    pub files: Vec<TempFile>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EditError {
    #[error("post is not open")]
    NotOpen,
    #[error("nothing to erase")]
    EmptyBody,
    #[error("splice out of bounds")]
    OutOfBounds,
    #[error("post already has an image")]
    HasImage,
}

/// Public post model, as replicated to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: PostId,
    pub thread: PostId,
    pub board: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub editing: bool,
    #[serde(default)]
    pub sage: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    /// Raw body text. Authoritative while `editing`.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub body: Vec<Segment>,
    /// linking post id -> linking post's thread
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backlinks: BTreeMap<PostId, PostId>,
}

impl Post {
    pub fn is_thread(&self) -> bool {
        self.id == self.thread
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    /// Apply a replicated update addressed to this post. Thread-level updates are ignored.
    pub fn apply(&mut self, update: &Update) -> Result<(), EditError> {
        match update {
            Update::AppendBody { text, .. } => {
                self.ensure_open()?;
                self.text.push_str(text);
            }
            Update::Backspace { .. } => {
                self.ensure_open()?;
                if self.text.pop().is_none() {
                    return Err(EditError::EmptyBody);
                }
            }
            Update::SpliceBody { start, len, text, .. } => {
                self.ensure_open()?;
                self.text = splice_chars(&self.text, *start, *len, text)?;
            }
            Update::ClosePost { body, .. } => {
                self.editing = false;
                self.body = body.clone();
            }
            Update::Backlink { by, by_thread, .. } => {
                self.backlinks.insert(*by, *by_thread);
            }
            Update::InsertImage { image, .. } => {
                if self.image.is_some() {
                    return Err(EditError::HasImage);
                }
                self.image = Some(image.clone());
            }
            Update::SpoilerImage { .. } => {
                if let Some(img) = self.image.as_mut() {
                    img.spoiler = true;
                }
            }
            Update::DeletePost { .. } => self.deleted = true,
            Update::Ban { .. } => self.banned = true,
            Update::InsertThread(_) | Update::InsertPost(_) | Update::LockThread { .. } => {}
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), EditError> {
        if self.editing { Ok(()) } else { Err(EditError::NotOpen) }
    }
}

/// Replace `len` chars at char offset `start` with `text`.
pub fn splice_chars(src: &str, start: usize, len: usize, text: &str) -> Result<String, EditError> {
    let total = src.chars().count();
    if start.checked_add(len).map_or(true, |end| end > total) {
        return Err(EditError::OutOfBounds);
    }
    let mut out = String::with_capacity(src.len() + text.len());
    out.extend(src.chars().take(start));
    out.push_str(text);
    out.extend(src.chars().skip(start + len));
    Ok(out)
}

/// Stored post: the public model plus fields only the server may see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    #[serde(flatten)]
    pub post: Post,
    pub ip: String,
    /// Salted SHA-256 of the reclaim password, open posts only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Thread {
    pub id: PostId,
    pub board: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
    pub bump_time: DateTime<Utc>,
    #[serde(default)]
    pub locked: bool,
    /// Posts including the OP
    pub post_count: u32,
    pub image_count: u32,
    /// Highest seq in the replication log
    pub log_ctr: u64,
}

impl Thread {
    pub fn reply_count(&self) -> u32 {
        self.post_count.saturating_sub(1)
    }
}

/// One entry of a thread's append-only replication log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ban {
    pub ip: String,
    pub reason: String,
    pub post: PostId,
    pub expires_at: DateTime<Utc>,
}
