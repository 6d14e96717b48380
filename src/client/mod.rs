//! Client side of the live thread protocol.
//!
//! [`session::ConnectionSession`] is a pure state machine: it consumes [`session::Event`]s
//! and returns [`session::Effect`]s. [`driver`] wires it to a real socket, timers and the
//! HTTP backlog.

pub mod backlog;
pub mod driver;
pub mod model;
pub mod session;

use thiserror::Error;

use crate::error::ProtocolError;
use crate::models::{EditError, PostId};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backlog request failed ({status}): {message}")]
    Backlog { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("update for unknown post {0}")]
    UnknownPost(PostId),
    #[error("post {id}: {source}")]
    Edit { id: PostId, source: EditError },
}
