use std::fmt::Display;

/// Which stage of the orchestrator a fatal error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Register,
    Tracker,
    Sink,
    Move,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register => write!(f, "register"),
            Self::Tracker => write!(f, "tracker"),
            Self::Sink => write!(f, "sink"),
            Self::Move => write!(f, "move"),
        }
    }
}

/// Structured fatal error: a message plus the stage that produced it.
#[derive(Debug, Clone)]
pub struct OrchestratorError {
    pub stage: Stage,
    pub msg: String,
}

impl OrchestratorError {
    pub fn new(stage: Stage, msg: impl Into<String>) -> Self {
        Self {
            stage,
            msg: msg.into(),
        }
    }

    pub fn register(msg: impl Into<String>) -> Self {
        Self::new(Stage::Register, msg)
    }

    pub fn tracker(msg: impl Into<String>) -> Self {
        Self::new(Stage::Tracker, msg)
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        Self::new(Stage::Sink, msg)
    }

    pub fn move_stage(msg: impl Into<String>) -> Self {
        Self::new(Stage::Move, msg)
    }
}

impl Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.msg)
    }
}

impl std::error::Error for OrchestratorError {}

/// Why the orchestrator fell through to the `SourceDownloader`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackSourceReason {
    #[default]
    None,
    SourceError,
    DownloadError,
}

impl BackSourceReason {
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::None)
    }
}
