use crate::protocol::{DispatchRecord, ScanSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

/// How many forwarded warning/error lines the board keeps.
pub const RECENT_LOG_LIMIT: usize = 20;

/// Observable view of the watch engine.  `rev` is incremented on every
/// change so pollers can tell whether anything moved.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WatchStatus {
    #[serde(default)]
    pub rev: u64,
    pub selected_event_id: Option<String>,
    pub is_watching: bool,
    /// Latest probe result; cleared when switching events.
    pub last_snapshot: Option<ScanSnapshot>,
    /// Track currently being timed, with milliseconds held so far.
    pub candidate: Option<CandidateStatus>,
    pub last_dispatched: Option<String>,
    /// Transient probe failure text, cleared by the next successful sample.
    pub probe_error: Option<String>,
    pub last_dispatch: Option<DispatchRecord>,
    #[serde(default)]
    pub recent_logs: VecDeque<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateStatus {
    pub raw_name: String,
    pub held_ms: u64,
}

/// Shared handle to the current `WatchStatus`.  Only the daemon core writes;
/// the control API and other observers read.
#[derive(Clone, Default)]
pub struct StatusBoard {
    status: Arc<RwLock<WatchStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> WatchStatus {
        self.status.read().await.clone()
    }

    pub async fn set_session(&self, event_id: Option<String>, is_watching: bool) {
        let mut status = self.status.write().await;
        status.selected_event_id = event_id;
        status.is_watching = is_watching;
        status.rev += 1;
    }

    /// Forget everything tied to the current watch: candidate, last
    /// dispatched track and, when `drop_snapshot` is set, the last probe result.
    pub async fn clear_session_memory(&self, drop_snapshot: bool) {
        let mut status = self.status.write().await;
        status.candidate = None;
        status.last_dispatched = None;
        status.probe_error = None;
        if drop_snapshot {
            status.last_snapshot = None;
        }
        status.rev += 1;
    }

    pub async fn record_sample(
        &self,
        snapshot: Option<ScanSnapshot>,
        candidate: Option<CandidateStatus>,
        last_dispatched: Option<String>,
    ) {
        let mut status = self.status.write().await;
        if snapshot.is_some() {
            status.last_snapshot = snapshot;
        }
        status.candidate = candidate;
        status.last_dispatched = last_dispatched;
        status.probe_error = None;
        status.rev += 1;
    }

    pub async fn set_probe_error(&self, message: String) {
        let mut status = self.status.write().await;
        status.probe_error = Some(message);
        status.rev += 1;
    }

    pub async fn record_dispatch(&self, record: DispatchRecord) {
        let mut status = self.status.write().await;
        status.last_dispatch = Some(record);
        status.rev += 1;
    }

    pub async fn push_log(&self, line: String) {
        let mut status = self.status.write().await;
        if status.recent_logs.len() == RECENT_LOG_LIMIT {
            status.recent_logs.pop_front();
        }
        status.recent_logs.push_back(line);
        status.rev += 1;
    }
}
