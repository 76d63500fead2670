use std::collections::HashMap;
use std::fmt::Display;

use bytes::Bytes;
use serde::Serialize;

/// Outcome a fetcher (or the orchestrator itself, for synthetic events) reports for a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceResult {
    #[default]
    Running,
    /// We already had this range before the tracker re-offered it.
    SemiSuccess,
    Success,
    Fail,
    Invalid,
}

impl PieceResult {
    /// Terminal per-piece states that force a tracker call on the next merge.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Invalid)
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::SemiSuccess)
    }
}

impl Display for PieceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::SemiSuccess => write!(f, "semi-success"),
            Self::Success => write!(f, "success"),
            Self::Fail => write!(f, "fail"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceStatus {
    Start,
    #[default]
    Running,
    Finish,
}

/// In-flight record for one piece-range request/response.
#[derive(Debug, Clone, Default)]
pub struct Piece {
    pub task_id: String,
    pub super_node: String,
    pub dst_cid: String,
    pub range: String,
    pub result: PieceResult,
    pub status: PieceStatus,
    /// 0 means "unspecified/control event".
    pub piece_size: i32,
    pub content: Bytes,
}

impl Piece {
    pub fn start(super_node: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            super_node: super_node.into(),
            status: PieceStatus::Start,
            ..Default::default()
        }
    }

    /// Synthetic re-advertisement for a range we already have (P5).
    pub fn semi_success(range: impl Into<String>, super_node: impl Into<String>, task_id: impl Into<String>, dst_cid: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            super_node: super_node.into(),
            dst_cid: dst_cid.into(),
            range: range.into(),
            result: PieceResult::SemiSuccess,
            status: PieceStatus::Running,
            ..Default::default()
        }
    }
}

impl Display for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "piece range={:?} result={} status={:?} node={} task={}",
            self.range, self.result, self.status, self.super_node, self.task_id
        )
    }
}

/// Event queue item. A tagged enum rather than overloading
/// `Piece.status == Start` keeps the merge function total.
#[derive(Debug, Clone)]
pub enum Event {
    Start(Piece),
    Piece(Piece),
}

impl Event {
    pub fn into_piece(self) -> Piece {
        match self {
            Event::Start(p) | Event::Piece(p) => p,
        }
    }

    pub fn piece(&self) -> &Piece {
        match self {
            Event::Start(p) | Event::Piece(p) => p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    InFlight,
    Done,
}

/// Mapping `range -> state`. Absence means "not yet assigned".
///
/// Only the orchestrator ever mutates this map; fetchers only ever send
/// events back on the event queue — shared mutable state without locks,
/// kept sound by a single-writer invariant.
#[derive(Debug, Default)]
pub struct PieceSet {
    ranges: HashMap<String, PieceState>,
}

impl PieceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, range: &str) -> Option<PieceState> {
        self.ranges.get(range).copied()
    }

    pub fn contains(&self, range: &str) -> bool {
        self.ranges.contains_key(range)
    }

    pub fn insert_in_flight(&mut self, range: impl Into<String>) {
        self.ranges.insert(range.into(), PieceState::InFlight);
    }

    pub fn mark_done(&mut self, range: &str) -> bool {
        if let Some(state) = self.ranges.get_mut(range) {
            *state = PieceState::Done;
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, range: &str) -> Option<PieceState> {
        self.ranges.remove(range)
    }

    pub fn running_count(&self) -> usize {
        self.ranges
            .values()
            .filter(|s| **s == PieceState::InFlight)
            .count()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_transitions_to_done() {
        let mut set = PieceSet::new();
        set.insert_in_flight("0-1023");
        assert_eq!(set.get("0-1023"), Some(PieceState::InFlight));
        assert!(set.mark_done("0-1023"));
        assert_eq!(set.get("0-1023"), Some(PieceState::Done));
    }

    #[test]
    fn marking_done_unknown_range_is_noop() {
        let mut set = PieceSet::new();
        assert!(!set.mark_done("0-1023"));
        assert!(set.is_empty());
    }

    #[test]
    fn running_count_ignores_done_ranges() {
        let mut set = PieceSet::new();
        set.insert_in_flight("a");
        set.insert_in_flight("b");
        set.mark_done("a");
        assert_eq!(set.running_count(), 1);
    }

    #[test]
    fn clear_resets_map() {
        let mut set = PieceSet::new();
        set.insert_in_flight("a");
        set.clear();
        assert!(set.is_empty());
    }
}
