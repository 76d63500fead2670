use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};

use crate::piece::{Event, Piece, PieceResult, PieceStatus};
use crate::sink::SinkMessage;
use crate::tracker::PieceTask;

/// Contract for fetching one piece's bytes from the peer the tracker
/// assigned. Fetchers never touch `PieceSet` directly — they only
/// ever report back on the event/sink queues.
pub trait PeerFetcher: Send + Sync + 'static {
    fn fetch(
        &self,
        task: &PieceTask,
    ) -> impl std::future::Future<Output = anyhow::Result<Bytes>> + Send;
}

/// HTTP range-GET implementation: issues `GET {task.url}` with a `Range`
/// header derived from `task.range` and the caller-supplied headers.
#[derive(Debug, Clone)]
pub struct HttpPeerFetcher {
    client: reqwest::Client,
}

impl HttpPeerFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpPeerFetcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl PeerFetcher for HttpPeerFetcher {
    async fn fetch(&self, task: &PieceTask) -> anyhow::Result<Bytes> {
        let mut request = self
            .client
            .get(&task.url)
            .header("Range", format!("bytes={}", task.range));
        for (key, value) in &task.headers {
            request = request.header(key, value);
        }
        let response = request.send().await.context("send peer fetch request")?;
        let response = response
            .error_for_status()
            .context("peer returned error status")?;
        let bytes = response.bytes().await.context("read peer response body")?;
        Ok(bytes)
    }
}

/// Spawns one task per accepted piece-task, capped by `semaphore`.
/// Completion is reported as a `Piece` event and, on success, the raw
/// payload on the sink queue — an `Arc<Semaphore>`-gated fan-out over
/// concurrent peer fetches, one task per unit of work.
pub fn spawn_fetcher<F: PeerFetcher>(
    fetcher: Arc<F>,
    semaphore: Arc<Semaphore>,
    task: PieceTask,
    super_node: String,
    task_id: String,
    events_tx: mpsc::UnboundedSender<Event>,
    sink_tx: mpsc::Sender<SinkMessage>,
) {
    tokio::spawn(async move {
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let range = task.range.clone();
        let dst_cid = task.cid.clone();
        let piece_size = task.piece_size;
        let outcome = fetcher.fetch(&task).await;

        let mut event = Piece {
            task_id,
            super_node,
            dst_cid,
            range: range.clone(),
            status: PieceStatus::Running,
            piece_size,
            ..Default::default()
        };

        match outcome {
            Ok(bytes) => match verify_range_length(&range, bytes.len()) {
                Ok(()) => {
                    event.result = PieceResult::Success;
                    event.content = bytes.clone();
                    let _ = sink_tx.send(SinkMessage::Payload { range, bytes }).await;
                }
                Err(e) => {
                    tracing::warn!(range = %event.range, "Peer returned a malformed payload: {e}");
                    event.result = PieceResult::Invalid;
                }
            },
            Err(e) => {
                tracing::warn!(range = %event.range, "Peer fetch failed: {e}");
                event.result = PieceResult::Fail;
            }
        }
        let _ = events_tx.send(Event::Piece(event));
    });
}

/// Confirms a fetched payload's length matches what `"start-end"` declares,
/// before it's trusted as a `Success` and handed to the sink.
fn verify_range_length(range: &str, len: usize) -> anyhow::Result<()> {
    let (start, end) = range.split_once('-').with_context(|| format!("malformed range {range:?}"))?;
    let start: u64 = start.parse().with_context(|| format!("bad range start in {range:?}"))?;
    let end: u64 = end.parse().with_context(|| format!("bad range end in {range:?}"))?;
    anyhow::ensure!(end >= start, "range end before start in {range:?}");
    let expected = end - start + 1;
    anyhow::ensure!(
        expected == len as u64,
        "range {range} declares {expected} bytes but peer returned {len}"
    );
    Ok(())
}
