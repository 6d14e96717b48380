use actix_web::{http::StatusCode, HttpResponse, ResponseError};

use crate::imager::AllocError;
use crate::models::EditError;
use crate::store::StoreError;

/// Fatal protocol violations. The session is told `invalid` and disconnected.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame")]
    BadFrame,
    #[error("unknown message type {0}")]
    UnknownTag(u8),
    #[error("unexpected message type {0}")]
    Unexpected(u8),
    #[error("nested concat")]
    NestedConcat,
    #[error("invalid payload for message type {tag}: {source}")]
    Payload {
        tag: u8,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("not synchronised")]
    NotSynced,
    #[error("already synchronised")]
    AlreadySynced,
    #[error("invalid progress counter")]
    InvalidCounter,
    #[error("invalid board")]
    InvalidBoard,
    #[error("{0}")]
    Other(String),
}

/// Rejections of a single client request. The connection stays open.
#[derive(thiserror::Error, Debug)]
pub enum PostError {
    #[error("read only")]
    ReadOnly,
    #[error("thread does not exist")]
    NoThread,
    #[error("thread is locked")]
    Locked,
    #[error("too soon")]
    TooSoon,
    #[error("reduce your speed")]
    Throttled,
    #[error("you are banned")]
    Banned,
    #[error("no open post")]
    NoOpenPost,
    #[error("already have an open post")]
    AlreadyOpen,
    #[error("post not found")]
    NoPost,
    #[error("no post body")]
    Empty,
    #[error("too long")]
    TooLong,
    #[error("too many lines")]
    TooManyLines,
    #[error("{0} too long")]
    FieldTooLong(&'static str),
    #[error("image required")]
    NoImage,
    #[error("insufficient privileges")]
    Forbidden,
    #[error("{0}")]
    Image(AllocError),
    #[error("{0}")]
    Edit(#[from] EditError),
    #[error("try again")]
    Infrastructure(String),
}

impl PostError {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, PostError::Infrastructure(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PostError::ReadOnly => "read_only",
            PostError::NoThread => "no_thread",
            PostError::Locked => "locked",
            PostError::TooSoon => "too_soon",
            PostError::Throttled => "throttled",
            PostError::Banned => "banned",
            PostError::NoOpenPost => "no_open_post",
            PostError::AlreadyOpen => "already_open",
            PostError::NoPost => "no_post",
            PostError::Empty => "empty",
            PostError::TooLong => "too_long",
            PostError::TooManyLines => "too_many_lines",
            PostError::FieldTooLong(_) => "field_too_long",
            PostError::NoImage => "no_image",
            PostError::Forbidden => "forbidden",
            PostError::Image(_) => "image",
            PostError::Edit(_) => "edit",
            PostError::Infrastructure(_) => "infrastructure",
        }
    }
}

impl From<StoreError> for PostError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => PostError::NoPost,
            other => PostError::Infrastructure(other.to_string()),
        }
    }
}

impl From<AllocError> for PostError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Store(inner) => PostError::Infrastructure(inner.to_string()),
            AllocError::Media(inner) => PostError::Infrastructure(inner.to_string()),
            other => PostError::Image(other),
        }
    }
}

/// HTTP errors. Bodies are plain text.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("internal error")]
    Internal,
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict => ApiError::Conflict,
            StoreError::Internal(msg) => {
                tracing::error!(error = %msg, "store failure");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .content_type("text/plain; charset=utf-8")
            .body(self.to_string())
    }
}
