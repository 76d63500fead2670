use std::time::Duration;

/// Tracker response codes, kept out of the orchestrator's control-flow so
/// they can be remapped without touching the merge/migration logic.
#[derive(Debug, Clone, Copy)]
pub struct ResponseCodeTable {
    pub continue_code: i32,
    pub finish: i32,
    pub wait: i32,
    pub limited: i32,
    pub source_error: i32,
    pub success: i32,
}

impl Default for ResponseCodeTable {
    fn default() -> Self {
        Self {
            continue_code: 601,
            finish: 602,
            wait: 603,
            limited: 604,
            source_error: 605,
            success: 200,
        }
    }
}

impl ResponseCodeTable {
    /// Codes the orchestrator treats as "accept the response and move on"
    /// rather than triggering migration.
    pub fn is_accepted(&self, code: i32) -> bool {
        code == self.continue_code
            || code == self.finish
            || code == self.limited
            || code == self.success
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Event-queue poll timeout. Defaults to 2 seconds.
    pub poll_timeout: Duration,
    /// Sink queue capacity. Defaults to 4.
    pub sink_queue_capacity: usize,
    /// Soft pipeline depth threshold used by the merge policy.
    pub pipeline_depth: usize,
    /// Maximum concurrently running `PeerFetcher` tasks.
    pub fetcher_concurrency: usize,
    /// Jittered backoff bounds on tracker `WAIT`.
    pub wait_backoff: (Duration, Duration),
    /// Cap on consecutive migrations attempted within one `pull_piece_task`
    /// call, in place of unbounded migration recursion.
    pub max_migrations: u32,
    pub codes: ResponseCodeTable,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(2),
            sink_queue_capacity: 4,
            pipeline_depth: 2,
            fetcher_concurrency: 16,
            wait_backoff: (Duration::from_millis(600), Duration::from_millis(2000)),
            max_migrations: 5,
            codes: ResponseCodeTable::default(),
        }
    }
}
