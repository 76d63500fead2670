use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use piece_orchestrator::{pull_file, OrchestratorConfig, PullConfig};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Pull a file from a supernode-coordinated peer cluster, falling back to a
/// direct source download if the cluster can't serve it.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Supernode registration endpoint
    #[arg(long)]
    registry_url: String,
    /// File identifier/URL announced to the registry
    #[arg(long)]
    file_url: String,
    /// Direct-download URL used for back-to-source fallback
    #[arg(long)]
    source_url: String,
    /// This client's content id, announced to peers
    #[arg(long, default_value = "local-client")]
    client_cid: String,
    /// Port this client listens on for peer connections
    #[arg(long, default_value_t = 6881)]
    peer_port: u16,
    /// Directory the in-progress and served copies are written under
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    /// Final output file path
    #[arg(long)]
    output: PathBuf,
    /// Expected SHA-256 of the assembled file, verified before the final move
    #[arg(long)]
    sha256: Option<String>,
    /// Sink queue capacity
    #[arg(long, default_value_t = OrchestratorConfig::default().sink_queue_capacity)]
    sink_queue_capacity: usize,
    /// Event-queue poll timeout, in milliseconds
    #[arg(long, default_value_t = 2000)]
    poll_timeout_ms: u64,
    /// Maximum concurrently running peer fetchers
    #[arg(long, default_value_t = OrchestratorConfig::default().fetcher_concurrency)]
    fetcher_concurrency: usize,
    /// Maximum supernode migrations attempted per piece-task call
    #[arg(long, default_value_t = OrchestratorConfig::default().max_migrations)]
    max_migrations: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = OrchestratorConfig::default();
    config.poll_timeout = Duration::from_millis(args.poll_timeout_ms);
    config.sink_queue_capacity = args.sink_queue_capacity;
    config.fetcher_concurrency = args.fetcher_concurrency;
    config.max_migrations = args.max_migrations;

    let pull = PullConfig {
        registry_url: args.registry_url,
        file_url: args.file_url,
        local_cid: args.client_cid,
        peer_port: args.peer_port,
        client_file_path: args.data_dir.join("client.part"),
        service_file_path: args.data_dir.join("service.part"),
        target_file: args.output,
        source_url: args.source_url,
        expected_sha256: args.sha256,
    };

    match pull_file(config, pull, CancellationToken::new()).await {
        Ok(outcome) => {
            tracing::info!(?outcome, "pull finished");
            println!("{outcome:?}");
        }
        Err(e) => {
            tracing::error!("pull failed: {e}");
            eprintln!("pull failed: {e}");
            std::process::exit(1);
        }
    }
}
