use std::collections::HashMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::ResponseCodeTable;
use crate::piece::{Piece, PieceResult, PieceStatus};

/// Request body for `pull_piece_task`.
#[derive(Debug, Clone, Serialize)]
pub struct PullPieceTaskRequest {
    pub src_cid: String,
    pub dst_cid: String,
    pub range: String,
    pub result: PieceResult,
    pub status: PieceStatus,
    pub task_id: String,
}

impl PullPieceTaskRequest {
    pub fn from_piece(local_cid: &str, item: &Piece) -> Self {
        Self {
            src_cid: local_cid.to_owned(),
            dst_cid: item.dst_cid.clone(),
            range: item.range.clone(),
            result: item.result,
            status: item.status,
            task_id: item.task_id.clone(),
        }
    }
}

/// One assignment handed back on a `CONTINUE` response.
#[derive(Debug, Clone, Deserialize)]
pub struct PieceTask {
    pub range: String,
    pub cid: String,
    pub piece_size: i32,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub code: i32,
    #[serde(default)]
    pub data: Vec<PieceTask>,
}

/// Contract for talking to the current supernode. Out of scope to
/// _design_ the wire format beyond what's specified; in scope to implement
/// one concrete transport (HTTP/JSON) for the full crate.
pub trait TrackerApi: Send + Sync {
    fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> impl std::future::Future<Output = anyhow::Result<Response>> + Send;
}

/// HTTP/JSON implementation. The wire shape is intentionally simple: a POST
/// of the request struct to `{node}/piece/task`, a JSON `Response` body.
#[derive(Debug, Clone)]
pub struct HttpTrackerApi {
    client: reqwest::Client,
}

impl HttpTrackerApi {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTrackerApi {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl TrackerApi for HttpTrackerApi {
    async fn pull_piece_task(
        &self,
        node: &str,
        req: &PullPieceTaskRequest,
    ) -> anyhow::Result<Response> {
        let url = format!("{node}/piece/task");
        tracing::debug!(%url, range = %req.range, "Pulling piece task");
        let response = self
            .client
            .post(url)
            .json(req)
            .send()
            .await
            .context("send pull_piece_task request")?;
        let response: Response = response
            .json()
            .await
            .context("decode pull_piece_task response")?;
        Ok(response)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Continue,
    Finish,
    Wait,
    SourceError,
    /// Accepted but uninteresting to the orchestrator (e.g. `LIMITED`,
    /// bare `SUCCESS`).
    Other,
    /// Not one of the codes `{CONTINUE, FINISH, LIMITED, SUCCESS, WAIT,
    /// SOURCE_ERROR}` — triggers migration.
    Unknown,
}

pub fn classify(code: i32, codes: &ResponseCodeTable) -> ResponseKind {
    if code == codes.continue_code {
        ResponseKind::Continue
    } else if code == codes.finish {
        ResponseKind::Finish
    } else if code == codes.wait {
        ResponseKind::Wait
    } else if code == codes.source_error {
        ResponseKind::SourceError
    } else if codes.is_accepted(code) {
        ResponseKind::Other
    } else {
        ResponseKind::Unknown
    }
}
