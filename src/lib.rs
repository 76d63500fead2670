use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
pub mod fetcher;
pub mod piece;
pub mod registrar;
pub mod sink;
pub mod source;
pub mod tracker;

mod orchestrator;

pub use config::{OrchestratorConfig, ResponseCodeTable};
pub use error::{BackSourceReason, OrchestratorError, Stage};
pub use fetcher::{HttpPeerFetcher, PeerFetcher};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use piece::{Event, Piece, PieceResult, PieceSet, PieceState, PieceStatus};
pub use registrar::{HttpRegistrar, RegisterResult, Registrar};
pub use sink::{FileSink, PieceSink, SinkHandle, SinkMessage};
pub use source::{HttpSourceDownloader, SourceDownloader};
pub use tracker::{classify, HttpTrackerApi, PieceTask, PullPieceTaskRequest, Response, ResponseKind, TrackerApi};

/// Everything needed to pull one file through the default HTTP transports,
/// as a single wiring facade over the individual HTTP collaborators.
#[derive(Debug, Clone)]
pub struct PullConfig {
    pub registry_url: String,
    pub file_url: String,
    pub local_cid: String,
    pub peer_port: u16,
    pub client_file_path: PathBuf,
    pub service_file_path: PathBuf,
    pub target_file: PathBuf,
    pub source_url: String,
    pub expected_sha256: Option<String>,
}

/// Wires up the default HTTP `TrackerApi`/`Registrar`/`PeerFetcher`/
/// `SourceDownloader` and a `FileSink`, then runs an `Orchestrator` to
/// completion or to a back-to-source fallback.
pub async fn pull_file(
    config: OrchestratorConfig,
    pull: PullConfig,
    cancellation_token: CancellationToken,
) -> Result<RunOutcome, OrchestratorError> {
    let client = reqwest::Client::new();
    let tracker = HttpTrackerApi::new(client.clone());
    let registrar = HttpRegistrar::new(client.clone(), pull.registry_url, pull.file_url);
    let fetcher = HttpPeerFetcher::new(client.clone());
    let source = HttpSourceDownloader::new(client, pull.source_url);

    let orchestrator = Orchestrator::new(
        config,
        tracker,
        registrar,
        fetcher,
        source,
        pull.local_cid,
        pull.peer_port,
        pull.client_file_path.clone(),
        pull.service_file_path.clone(),
        pull.target_file,
        pull.expected_sha256,
    );
    let sink = FileSink::new(pull.client_file_path, pull.service_file_path);
    orchestrator.run(sink, cancellation_token).await
}
