use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::OrchestratorConfig;
use crate::error::{BackSourceReason, OrchestratorError};
use crate::fetcher::{spawn_fetcher, PeerFetcher};
use crate::piece::{Event, Piece, PieceResult, PieceSet, PieceState};
use crate::registrar::Registrar;
use crate::sink::{self, PieceSink, SinkHandle, SinkMessage};
use crate::source::SourceDownloader;
use crate::tracker::{classify, PieceTask, PullPieceTaskRequest, Response, ResponseKind, TrackerApi};

/// What a completed run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { total_bytes: u64 },
    FellBackToSource { written_bytes: u64 },
}

/// The main loop: polls the tracker, spawns fetchers, merges their
/// completions, and drives the sink to a finished file.
///
/// Only this type mutates `node`, `task_id`, `piece_size_history`,
/// `piece_set`, `total_bytes`, and `back_source_reason`; fetchers only ever
/// report back on the event/sink queues, so none of that state needs a lock.
pub struct Orchestrator<T, R, F, D> {
    config: OrchestratorConfig,
    tracker: T,
    registrar: R,
    fetcher: Arc<F>,
    source: D,
    local_cid: String,
    peer_port: u16,
    client_file_path: PathBuf,
    service_file_path: PathBuf,
    target_file: PathBuf,
    expected_sha256: Option<String>,

    node: String,
    task_id: String,
    piece_size_history: (i32, i32),
    piece_set: PieceSet,
    total_bytes: u64,
    back_source_reason: BackSourceReason,
}

impl<T, R, F, D> Orchestrator<T, R, F, D>
where
    T: TrackerApi,
    R: Registrar,
    F: PeerFetcher,
    D: SourceDownloader,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        tracker: T,
        registrar: R,
        fetcher: F,
        source: D,
        local_cid: impl Into<String>,
        peer_port: u16,
        client_file_path: impl Into<PathBuf>,
        service_file_path: impl Into<PathBuf>,
        target_file: impl Into<PathBuf>,
        expected_sha256: Option<String>,
    ) -> Self {
        Self {
            config,
            tracker,
            registrar,
            fetcher: Arc::new(fetcher),
            source,
            local_cid: local_cid.into(),
            peer_port,
            client_file_path: client_file_path.into(),
            service_file_path: service_file_path.into(),
            target_file: target_file.into(),
            expected_sha256,
            node: String::new(),
            task_id: String::new(),
            piece_size_history: (0, 0),
            piece_set: PieceSet::new(),
            total_bytes: 0,
            back_source_reason: BackSourceReason::None,
        }
    }

    /// Registers, then runs the orchestration loop to completion or to a
    /// back-to-source fallback.
    pub async fn run<S: PieceSink>(
        mut self,
        sink: S,
        cancellation_token: CancellationToken,
    ) -> Result<RunOutcome, OrchestratorError> {
        let register = self
            .registrar
            .register(self.peer_port)
            .await
            .map_err(|e| OrchestratorError::register(e.to_string()))?;
        tracing::info!(
            node = %register.node,
            task_id = %register.task_id,
            piece_size = register.piece_size,
            "registered with supernode"
        );
        self.node = register.node;
        self.task_id = register.task_id;
        self.piece_size_history = (register.piece_size, register.piece_size);

        let task_tracker = TaskTracker::new();
        let (sink_handle, sink_done) = sink::spawn(
            sink,
            self.config.sink_queue_capacity,
            &task_tracker,
            cancellation_token.clone(),
        );
        task_tracker.close();
        let mut sink_done = Some(sink_done);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let semaphore = Arc::new(Semaphore::new(self.config.fetcher_concurrency));

        events_tx
            .send(Event::Start(Piece::start(self.node.clone(), self.task_id.clone())))
            .ok();

        let mut latest: Option<Piece> = None;
        let mut outcome = None;

        while outcome.is_none() {
            if self.back_source_reason.is_set() {
                break;
            }

            let (proceed, next_latest) = self.get_next(latest, &mut events_rx).await;
            latest = next_latest;
            if !proceed {
                continue;
            }
            let item = latest.clone().expect("proceed implies latest is populated");

            match self.pull_piece_task(&item).await {
                Err(e) => return Err(e),
                Ok((response, migrated_item)) => match classify(response.code, &self.config.codes) {
                    ResponseKind::Continue => {
                        self.process_piece(&response, &migrated_item, &events_tx, &sink_handle.message_tx, &semaphore)
                            .await?;
                    }
                    ResponseKind::Finish => {
                        let done_rx = sink_done.take().expect("finish reached only once");
                        self.finish(&sink_handle, done_rx).await?;
                        outcome = Some(RunOutcome::Completed {
                            total_bytes: self.total_bytes,
                        });
                    }
                    ResponseKind::SourceError => {
                        self.back_source_reason = BackSourceReason::SourceError;
                    }
                    ResponseKind::Other | ResponseKind::Unknown => {
                        tracing::warn!(code = response.code, "accepted but uninteresting tracker code");
                    }
                },
            }
        }

        if let Some(outcome) = outcome {
            task_tracker.wait().await;
            return Ok(outcome);
        }

        // Back-to-source: the sink never received `Last`, so abandon it via
        // cancellation rather than waiting for a join that will never come.
        cancellation_token.cancel();
        drop(sink_handle);
        task_tracker.wait().await;

        let written = self
            .source
            .download(&self.target_file)
            .await
            .map_err(|e| OrchestratorError::move_stage(e.to_string()))?;
        Ok(RunOutcome::FellBackToSource { written_bytes: written })
    }

    /// Merge point: polls the event queue with a timeout,
    /// folds the result into `piece_set`/`total_bytes`, and decides whether
    /// to call the tracker yet or keep collapsing completions.
    async fn get_next(
        &mut self,
        mut latest: Option<Piece>,
        events_rx: &mut mpsc::UnboundedReceiver<Event>,
    ) -> (bool, Option<Piece>) {
        let mut need_merge = true;

        match timeout(self.config.poll_timeout, events_rx.recv()).await {
            Err(_) | Ok(None) => {
                need_merge = false;
            }
            Ok(Some(event)) => {
                let mut item = event.into_piece();

                if item.piece_size != 0 && item.piece_size != self.piece_size_history.1 {
                    tracing::debug!(range = %item.range, "discarding stale fetcher from a prior piece size");
                    return (false, latest);
                }

                if item.super_node != self.node {
                    item.dst_cid.clear();
                    item.super_node = self.node.clone();
                    item.task_id = self.task_id.clone();
                }

                if !item.range.is_empty() {
                    match self.piece_set.get(&item.range) {
                        None => {
                            tracing::debug!(range = %item.range, "range neither running nor success, discarding");
                            return (false, latest);
                        }
                        Some(PieceState::InFlight) => {
                            if item.result.is_success_like() {
                                self.total_bytes += item.content.len() as u64;
                                self.piece_set.mark_done(&item.range);
                            } else {
                                // Open question, kept for fidelity: this removes the range on
                                // any non-success event, including a `Running` heartbeat with
                                // an empty result, not only on a terminal failure.
                                self.piece_set.remove(&item.range);
                            }
                        }
                        Some(PieceState::Done) => {}
                    }
                }

                latest = Some(item);
            }
        }

        let Some(latest_item) = latest.as_ref() else {
            return (false, None);
        };

        if matches!(
            latest_item.result,
            PieceResult::Success | PieceResult::Fail | PieceResult::Invalid
        ) {
            need_merge = false;
        }

        let running_count = self.piece_set.running_count();
        if need_merge && (events_rx.len() > 0 || running_count > self.config.pipeline_depth) {
            return (false, latest);
        }

        (true, latest)
    }

    async fn refresh(&mut self, item: &Piece, sink_tx: &mpsc::Sender<SinkMessage>) -> Result<(), OrchestratorError> {
        if self.piece_size_history.0 != self.piece_size_history.1 {
            sink_tx
                .send(SinkMessage::Reset)
                .await
                .map_err(|e| OrchestratorError::sink(e.to_string()))?;
            self.piece_set.clear();
            self.total_bytes = 0;
            self.piece_size_history.0 = self.piece_size_history.1;
            tracing::info!(piece_size = self.piece_size_history.1, "piece size changed, reset in-flight state");
        }
        if self.node != item.super_node {
            self.node = item.super_node.clone();
            self.task_id = item.task_id.clone();
        }
        Ok(())
    }

    /// Applies a refresh, then for each assigned range
    /// either re-advertises it (already `Done`, P5), leaves it alone
    /// (already `InFlight`, P4), or spawns a fetcher for it.
    async fn process_piece(
        &mut self,
        response: &Response,
        item: &Piece,
        events_tx: &mpsc::UnboundedSender<Event>,
        sink_tx: &mpsc::Sender<SinkMessage>,
        semaphore: &Arc<Semaphore>,
    ) -> Result<(), OrchestratorError> {
        self.refresh(item, sink_tx).await?;

        for task in &response.data {
            match self.piece_set.get(&task.range) {
                Some(PieceState::Done) => {
                    let synthetic =
                        Piece::semi_success(task.range.clone(), self.node.clone(), self.task_id.clone(), task.cid.clone());
                    let _ = events_tx.send(Event::Piece(synthetic));
                }
                Some(PieceState::InFlight) => {}
                None => {
                    self.piece_set.insert_in_flight(task.range.clone());
                    self.pull_rate(task);
                    spawn_fetcher(
                        Arc::clone(&self.fetcher),
                        Arc::clone(semaphore),
                        task.clone(),
                        self.node.clone(),
                        self.task_id.clone(),
                        events_tx.clone(),
                        sink_tx.clone(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Rate-limiting extension point; currently a no-op.
    fn pull_rate(&self, _task: &PieceTask) {}

    /// An explicit loop over WAIT-retries and
    /// migration attempts, bounded by `OrchestratorConfig::max_migrations`,
    /// in place of the unbounded recursion a literal port would produce.
    ///
    /// Returns the accepted response together with `item` rewritten to
    /// reflect any migration that happened along the way, so a caller never
    /// goes on to act on the pre-migration `node`/`task_id`.
    async fn pull_piece_task(&mut self, item: &Piece) -> Result<(Response, Piece), OrchestratorError> {
        let mut migrations = 0u32;
        let mut current = item.clone();

        loop {
            let request = PullPieceTaskRequest::from_piece(&self.local_cid, &current);
            let outcome = self.tracker.pull_piece_task(&self.node, &request).await;

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("tracker transport error: {e}");
                    migrations += 1;
                    if migrations > self.config.max_migrations {
                        return Err(OrchestratorError::register("exceeded migration attempt cap"));
                    }
                    self.migrate(&mut current, migrations).await?;
                    continue;
                }
            };

            match classify(response.code, &self.config.codes) {
                ResponseKind::Wait => {
                    let sleep_for = jittered_backoff(self.config.wait_backoff);
                    tracing::debug!(sleep_ms = sleep_for.as_millis() as u64, "tracker asked us to wait");
                    tokio::time::sleep(sleep_for).await;
                }
                ResponseKind::Unknown => {
                    migrations += 1;
                    if migrations > self.config.max_migrations {
                        return Err(OrchestratorError::register("exceeded migration attempt cap"));
                    }
                    tracing::warn!(code = response.code, attempt = migrations, "migrating to a new supernode");
                    self.migrate(&mut current, migrations).await?;
                }
                ResponseKind::Continue | ResponseKind::Finish | ResponseKind::SourceError | ResponseKind::Other => {
                    return Ok((response, current));
                }
            }
        }
    }

    /// Re-registers with the registrar and rewrites `current` (and `self`'s
    /// own `node`/`task_id`/`piece_size_history`) to the new supernode.
    async fn migrate(&mut self, current: &mut Piece, attempt: u32) -> Result<(), OrchestratorError> {
        let result = self
            .registrar
            .register(self.peer_port)
            .await
            .map_err(|e| OrchestratorError::register(e.to_string()))?;
        tracing::info!(node = %result.node, task_id = %result.task_id, attempt, "migrated to a new supernode");
        self.piece_size_history.1 = result.piece_size;
        current.status = crate::piece::PieceStatus::Start;
        current.super_node = result.node.clone();
        current.task_id = result.task_id.clone();
        self.node = result.node;
        self.task_id = result.task_id;
        Ok(())
    }

    /// Flush sentinel, join the sink, and (unless we're about
    /// to fall back to source) move the assembled file to its target.
    async fn finish(
        &mut self,
        sink_handle: &SinkHandle,
        sink_done: tokio::sync::oneshot::Receiver<anyhow::Result<bool>>,
    ) -> Result<(), OrchestratorError> {
        sink_handle
            .send(SinkMessage::Last)
            .await
            .map_err(|e| OrchestratorError::sink(e.to_string()))?;
        let across_write = sink_done
            .await
            .map_err(|_| OrchestratorError::sink("sink task ended without reporting completion"))?
            .map_err(|e| OrchestratorError::sink(e.to_string()))?;
        tracing::debug!(across_write, "sink joined");

        if self.back_source_reason.is_set() {
            return Ok(());
        }

        sink::move_to_target(&self.client_file_path, &self.target_file, self.expected_sha256.as_deref())
            .await
            .map_err(|e| OrchestratorError::move_stage(e.to_string()))?;
        Ok(())
    }
}

fn jittered_backoff((low, high): (Duration, Duration)) -> Duration {
    let low_ms = low.as_millis() as u64;
    let high_ms = high.as_millis() as u64;
    if high_ms <= low_ms {
        return low;
    }
    let millis = rand::rng().random_range(low_ms..=high_ms);
    Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use bytes::Bytes;

    use crate::error::Stage;
    use crate::registrar::RegisterResult;
    use crate::sink::FileSink;

    struct ScriptedTracker {
        responses: Mutex<VecDeque<Response>>,
        calls: AtomicUsize,
    }

    impl ScriptedTracker {
        fn new(responses: Vec<Response>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TrackerApi for ScriptedTracker {
        async fn pull_piece_task(&self, _node: &str, _req: &PullPieceTaskRequest) -> anyhow::Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.pop_front().unwrap_or(Response { code: 602, data: Vec::new() }))
        }
    }

    struct FailingTracker;

    impl TrackerApi for FailingTracker {
        async fn pull_piece_task(&self, _node: &str, _req: &PullPieceTaskRequest) -> anyhow::Result<Response> {
            anyhow::bail!("connection refused")
        }
    }

    struct ScriptedRegistrar {
        result: RegisterResult,
        calls: AtomicUsize,
    }

    impl Registrar for ScriptedRegistrar {
        async fn register(&self, _peer_port: u16) -> anyhow::Result<RegisterResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    struct FixedFetcher;

    impl PeerFetcher for FixedFetcher {
        async fn fetch(&self, task: &PieceTask) -> anyhow::Result<Bytes> {
            let (start, end) = task.range.split_once('-').unwrap();
            let len = end.parse::<u64>().unwrap() - start.parse::<u64>().unwrap() + 1;
            Ok(Bytes::from(vec![b'x'; len as usize]))
        }
    }

    struct NullSink;

    impl PieceSink for NullSink {
        async fn handle_message(&mut self, _message: SinkMessage) -> anyhow::Result<()> {
            Ok(())
        }

        fn across_write(&self) -> bool {
            false
        }
    }

    #[derive(Default)]
    struct NoopSource {
        calls: AtomicUsize,
    }

    impl SourceDownloader for NoopSource {
        async fn download(&self, _target: &std::path::Path) -> anyhow::Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    fn test_config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.poll_timeout = Duration::from_millis(200);
        config.wait_backoff = (Duration::from_millis(5), Duration::from_millis(15));
        config
    }

    fn registrar_returning(node: &str, task_id: &str, piece_size: i32) -> ScriptedRegistrar {
        ScriptedRegistrar {
            result: RegisterResult {
                node: node.to_owned(),
                task_id: task_id.to_owned(),
                piece_size,
                file_length: 0,
            },
            calls: AtomicUsize::new(0),
        }
    }

    fn new_orchestrator(
        tracker: ScriptedTracker,
        registrar: ScriptedRegistrar,
    ) -> Orchestrator<ScriptedTracker, ScriptedRegistrar, FixedFetcher, NoopSource> {
        Orchestrator::new(
            test_config(),
            tracker,
            registrar,
            FixedFetcher,
            NoopSource::default(),
            "local-cid",
            6881,
            std::env::temp_dir().join("piece-orchestrator-unused-client.bin"),
            std::env::temp_dir().join("piece-orchestrator-unused-service.bin"),
            std::env::temp_dir().join("piece-orchestrator-unused-target.bin"),
            None,
        )
    }

    #[tokio::test]
    async fn get_next_marks_range_done_and_accumulates_bytes() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);
        orch.piece_set.insert_in_flight("0-3");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let mut piece = Piece::start("S1", "T1");
        piece.range = "0-3".into();
        piece.result = PieceResult::Success;
        piece.content = Bytes::from_static(b"abcd");
        piece.super_node = "S1".into();
        events_tx.send(Event::Piece(piece)).unwrap();
        drop(events_tx);

        let (proceed, latest) = orch.get_next(None, &mut events_rx).await;
        assert!(proceed);
        assert!(latest.is_some());
        assert_eq!(orch.piece_set.get("0-3"), Some(PieceState::Done));
        assert_eq!(orch.total_bytes, 4);
    }

    #[tokio::test]
    async fn get_next_discards_event_with_stale_piece_size() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let mut piece = Piece::start("S1", "T1");
        piece.range = "0-3".into();
        piece.result = PieceResult::Success;
        piece.piece_size = 4;
        piece.super_node = "S1".into();
        events_tx.send(Event::Piece(piece)).unwrap();
        drop(events_tx);

        let (proceed, latest) = orch.get_next(None, &mut events_rx).await;
        assert!(!proceed);
        assert!(latest.is_none());
        assert!(orch.piece_set.is_empty());
    }

    #[tokio::test]
    async fn get_next_removes_inflight_range_on_failure_event() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);
        orch.piece_set.insert_in_flight("0-3");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let mut piece = Piece::start("S1", "T1");
        piece.range = "0-3".into();
        piece.result = PieceResult::Fail;
        piece.super_node = "S1".into();
        events_tx.send(Event::Piece(piece)).unwrap();
        drop(events_tx);

        let (proceed, _latest) = orch.get_next(None, &mut events_rx).await;
        assert!(proceed);
        assert!(orch.piece_set.get("0-3").is_none());
    }

    #[tokio::test]
    async fn get_next_forces_tracker_call_when_pipeline_shallow() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);
        orch.piece_set.insert_in_flight("4-7");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let mut piece = Piece::start("S1", "T1");
        piece.range = String::new();
        piece.result = PieceResult::Running;
        piece.super_node = "S1".into();
        events_tx.send(Event::Piece(piece)).unwrap();
        drop(events_tx);

        let (proceed, _latest) = orch.get_next(None, &mut events_rx).await;
        assert!(proceed);
    }

    #[tokio::test]
    async fn process_piece_spawns_once_and_skips_second_continue_for_inflight_range() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);

        let (events_tx, _events_rx) = mpsc::unbounded_channel::<Event>();
        let (sink_tx, _sink_rx) = mpsc::channel::<SinkMessage>(4);
        let semaphore = Arc::new(Semaphore::new(4));
        let item = Piece::start("S1", "T1");
        let response = Response {
            code: 601,
            data: vec![PieceTask {
                range: "0-3".into(),
                cid: "peer-1".into(),
                piece_size: 8,
                url: "https://example.test/piece".into(),
                headers: Default::default(),
            }],
        };

        orch.process_piece(&response, &item, &events_tx, &sink_tx, &semaphore).await.unwrap();
        assert_eq!(orch.piece_set.get("0-3"), Some(PieceState::InFlight));

        orch.process_piece(&response, &item, &events_tx, &sink_tx, &semaphore).await.unwrap();
        assert_eq!(orch.piece_set.get("0-3"), Some(PieceState::InFlight));
    }

    #[tokio::test]
    async fn process_piece_reoffers_done_range_without_refetching() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);
        orch.piece_set.insert_in_flight("0-3");
        orch.piece_set.mark_done("0-3");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let (sink_tx, _sink_rx) = mpsc::channel::<SinkMessage>(4);
        let semaphore = Arc::new(Semaphore::new(4));
        let item = Piece::start("S1", "T1");
        let response = Response {
            code: 601,
            data: vec![PieceTask {
                range: "0-3".into(),
                cid: "peer-2".into(),
                piece_size: 8,
                url: "https://example.test/piece".into(),
                headers: Default::default(),
            }],
        };

        orch.process_piece(&response, &item, &events_tx, &sink_tx, &semaphore).await.unwrap();

        let event = events_rx.recv().await.unwrap().into_piece();
        assert_eq!(event.result, PieceResult::SemiSuccess);
        assert_eq!(event.range, "0-3");
    }

    #[tokio::test]
    async fn process_piece_resets_state_on_piece_size_change() {
        let mut orch = new_orchestrator(ScriptedTracker::new(vec![]), registrar_returning("S1", "T1", 8));
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (4, 8);
        orch.piece_set.insert_in_flight("0-3");
        orch.total_bytes = 4;

        let (events_tx, _events_rx) = mpsc::unbounded_channel::<Event>();
        let (sink_tx, mut sink_rx) = mpsc::channel::<SinkMessage>(4);
        let semaphore = Arc::new(Semaphore::new(4));
        let item = Piece::start("S1", "T1");
        let response = Response { code: 601, data: vec![] };

        orch.process_piece(&response, &item, &events_tx, &sink_tx, &semaphore).await.unwrap();

        let message = sink_rx.recv().await.unwrap();
        assert!(matches!(message, SinkMessage::Reset));
        assert!(orch.piece_set.is_empty());
        assert_eq!(orch.total_bytes, 0);
        assert_eq!(orch.piece_size_history, (8, 8));
    }

    #[tokio::test]
    async fn pull_piece_task_retries_through_wait_then_returns_response() {
        let tracker = ScriptedTracker::new(vec![
            Response { code: 603, data: vec![] },
            Response { code: 603, data: vec![] },
            Response { code: 602, data: vec![] },
        ]);
        let registrar = registrar_returning("S1", "T1", 8);
        let mut orch = new_orchestrator(tracker, registrar);
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);

        let item = Piece::start("S1", "T1");
        let (response, _item) = orch.pull_piece_task(&item).await.unwrap();
        assert_eq!(response.code, 602);
        assert_eq!(orch.tracker.calls.load(Ordering::SeqCst), 3);
        assert_eq!(orch.registrar.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pull_piece_task_migrates_on_unknown_code() {
        let tracker = ScriptedTracker::new(vec![
            Response { code: 999, data: vec![] },
            Response { code: 602, data: vec![] },
        ]);
        let registrar = registrar_returning("S2", "T2", 16);
        let mut orch = new_orchestrator(tracker, registrar);
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);

        let item = Piece::start("S1", "T1");
        let (response, migrated_item) = orch.pull_piece_task(&item).await.unwrap();

        assert_eq!(response.code, 602);
        assert_eq!(orch.registrar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.node, "S2");
        assert_eq!(orch.task_id, "T2");
        assert_eq!(orch.piece_size_history.1, 16);
        assert_eq!(migrated_item.super_node, "S2");
        assert_eq!(migrated_item.task_id, "T2");
    }

    #[tokio::test]
    async fn pull_piece_task_aborts_once_migration_cap_is_exhausted() {
        let tracker = ScriptedTracker::new(vec![Response { code: 999, data: vec![] }, Response { code: 999, data: vec![] }]);
        let registrar = registrar_returning("S2", "T2", 8);
        let mut orch = new_orchestrator(tracker, registrar);
        orch.config.max_migrations = 1;
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);

        let item = Piece::start("S1", "T1");
        let err = orch.pull_piece_task(&item).await.unwrap_err();
        assert_eq!(err.stage, Stage::Register);
    }

    #[tokio::test]
    async fn pull_piece_task_migrates_on_transport_error() {
        let registrar = registrar_returning("S2", "T2", 16);
        let mut orch = Orchestrator::new(
            test_config(),
            FailingTracker,
            registrar,
            FixedFetcher,
            NoopSource::default(),
            "local-cid",
            6881,
            std::env::temp_dir().join("piece-orchestrator-unused-client.bin"),
            std::env::temp_dir().join("piece-orchestrator-unused-service.bin"),
            std::env::temp_dir().join("piece-orchestrator-unused-target.bin"),
            None,
        );
        orch.config.max_migrations = 1;
        orch.node = "S1".into();
        orch.task_id = "T1".into();
        orch.piece_size_history = (8, 8);

        let item = Piece::start("S1", "T1");
        let err = orch.pull_piece_task(&item).await.unwrap_err();
        assert_eq!(err.stage, Stage::Register);
        assert_eq!(orch.registrar.calls.load(Ordering::SeqCst), 1);
        assert_eq!(orch.node, "S2");
    }

    /// Regression test: a migration inside `pull_piece_task` must not be
    /// silently undone by `refresh` comparing against the pre-migration
    /// `Piece` snapshot afterward.
    #[tokio::test]
    async fn run_does_not_revert_node_after_mid_run_migration() {
        struct NodeAwareTracker {
            s1_calls: AtomicUsize,
            s2_calls: AtomicUsize,
        }

        impl TrackerApi for NodeAwareTracker {
            async fn pull_piece_task(&self, node: &str, _req: &PullPieceTaskRequest) -> anyhow::Result<Response> {
                if node == "S1" {
                    self.s1_calls.fetch_add(1, Ordering::SeqCst);
                    return Ok(Response { code: 999, data: vec![] });
                }
                let call = self.s2_calls.fetch_add(1, Ordering::SeqCst);
                Ok(match call {
                    0 => Response {
                        code: 601,
                        data: vec![PieceTask {
                            range: "0-3".into(),
                            cid: "peer-1".into(),
                            piece_size: 8,
                            url: "https://example.test/a".into(),
                            headers: Default::default(),
                        }],
                    },
                    1 => Response { code: 601, data: vec![] },
                    _ => Response { code: 602, data: vec![] },
                })
            }
        }

        struct SequencedRegistrar {
            results: Mutex<VecDeque<RegisterResult>>,
            calls: AtomicUsize,
        }

        impl Registrar for SequencedRegistrar {
            async fn register(&self, _peer_port: u16) -> anyhow::Result<RegisterResult> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let mut results = self.results.lock().unwrap();
                Ok(results.pop_front().expect("registrar called more times than scripted"))
            }
        }

        let dir = std::env::temp_dir().join(format!("piece-orchestrator-revert-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let client_path = dir.join("client.bin");
        let service_path = dir.join("service.bin");
        let target_path = dir.join("final.bin");

        let tracker = NodeAwareTracker {
            s1_calls: AtomicUsize::new(0),
            s2_calls: AtomicUsize::new(0),
        };
        let registrar = SequencedRegistrar {
            results: Mutex::new(
                vec![
                    RegisterResult { node: "S1".into(), task_id: "T1".into(), piece_size: 8, file_length: 0 },
                    RegisterResult { node: "S2".into(), task_id: "T2".into(), piece_size: 8, file_length: 0 },
                ]
                .into(),
            ),
            calls: AtomicUsize::new(0),
        };

        let orch = Orchestrator::new(
            test_config(),
            tracker,
            registrar,
            FixedFetcher,
            NoopSource::default(),
            "local-cid",
            6881,
            client_path.clone(),
            service_path.clone(),
            target_path.clone(),
            None,
        );

        let sink = FileSink::new(&client_path, &service_path);
        let outcome = orch.run(sink, CancellationToken::new()).await.unwrap();

        match outcome {
            RunOutcome::Completed { total_bytes } => assert_eq!(total_bytes, 4),
            other => panic!("expected Completed, got {other:?}"),
        }

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn run_completes_happy_path_and_moves_file_to_target() {
        let dir = std::env::temp_dir().join(format!("piece-orchestrator-orch-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let client_path = dir.join("client.bin");
        let service_path = dir.join("service.bin");
        let target_path = dir.join("final.bin");

        let tracker = ScriptedTracker::new(vec![
            Response {
                code: 601,
                data: vec![
                    PieceTask {
                        range: "0-3".into(),
                        cid: "peer-1".into(),
                        piece_size: 8,
                        url: "https://example.test/a".into(),
                        headers: Default::default(),
                    },
                    PieceTask {
                        range: "4-7".into(),
                        cid: "peer-2".into(),
                        piece_size: 8,
                        url: "https://example.test/b".into(),
                        headers: Default::default(),
                    },
                ],
            },
            Response { code: 601, data: vec![] },
            Response { code: 602, data: vec![] },
        ]);
        let registrar = registrar_returning("S1", "T1", 8);

        let orch = Orchestrator::new(
            test_config(),
            tracker,
            registrar,
            FixedFetcher,
            NoopSource::default(),
            "local-cid",
            6881,
            client_path.clone(),
            service_path.clone(),
            target_path.clone(),
            None,
        );

        let sink = FileSink::new(&client_path, &service_path);
        let outcome = orch.run(sink, CancellationToken::new()).await.unwrap();

        match outcome {
            RunOutcome::Completed { total_bytes } => assert_eq!(total_bytes, 8),
            other => panic!("expected Completed, got {other:?}"),
        }
        let content = tokio::fs::read(&target_path).await.unwrap();
        assert_eq!(content, b"xxxxxxxx");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn run_falls_back_to_source_when_tracker_reports_source_error() {
        let tracker = ScriptedTracker::new(vec![Response { code: 605, data: vec![] }]);
        let registrar = registrar_returning("S1", "T1", 8);

        let orch = Orchestrator::new(
            test_config(),
            tracker,
            registrar,
            FixedFetcher,
            NoopSource::default(),
            "local-cid",
            6881,
            std::env::temp_dir().join("piece-orchestrator-unused-client.bin"),
            std::env::temp_dir().join("piece-orchestrator-unused-service.bin"),
            std::env::temp_dir().join("piece-orchestrator-unused-target.bin"),
            None,
        );

        let outcome = orch.run(NullSink, CancellationToken::new()).await.unwrap();
        match outcome {
            RunOutcome::FellBackToSource { written_bytes } => assert_eq!(written_bytes, 0),
            other => panic!("expected FellBackToSource, got {other:?}"),
        }
    }
}
