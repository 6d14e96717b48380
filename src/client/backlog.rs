use serde::Serialize;
use tracing::debug;

use super::ClientError;
use crate::models::PostId;
use crate::protocol::FRAME_SEPARATOR;

#[derive(Serialize)]
struct LogRequest {
    id: PostId,
    start: u64,
    end: u64,
}

/// Fetches missed replication log slices over HTTP.
#[derive(Clone)]
pub struct BacklogFetcher {
    client: reqwest::Client,
    base: String,
}

impl BacklogFetcher {
    /// `base` is the HTTP origin, e.g. `http://localhost:8080`.
    pub fn new(base: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), base: base.into().trim_end_matches('/').to_string() }
    }

    /// Raw frames with `start <= seq < end`, in log order.
    pub async fn fetch(&self, thread: PostId, start: u64, end: u64) -> Result<Vec<String>, ClientError> {
        let resp = self
            .client
            .post(format!("{}/json/log", self.base))
            .json(&LogRequest { id: thread, start, end })
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ClientError::Backlog { status: status.as_u16(), message: body });
        }
        debug!(thread, start, end, bytes = body.len(), "backlog fetched");
        if body.is_empty() {
            return Ok(Vec::new());
        }
        Ok(body.split(FRAME_SEPARATOR).map(str::to_string).collect())
    }
}
