use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the local probe saw on one sample.  The last entry of
/// `found_tracks` is the track currently loaded; earlier ones are history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScanSnapshot {
    pub file_name: String,
    pub found_tracks: Vec<String>,
}

impl ScanSnapshot {
    pub fn current_track(&self) -> Option<&str> {
        self.found_tracks.last().map(String::as_str)
    }
}

/// Artist / title pair derived from a raw track name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub artist: String,
    pub title: String,
}

/// Bearer credential handed out by the identity client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Body POSTed to the track-update endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TrackUpdate {
    Playing {
        event_id: String,
        track_name: String,
        track_artist: String,
        source: String,
    },
    Stopped {
        event_id: String,
    },
}

impl TrackUpdate {
    pub fn kind(&self) -> DispatchKind {
        match self {
            Self::Playing { .. } => DispatchKind::Playing,
            Self::Stopped { .. } => DispatchKind::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    Playing,
    Stopped,
}

/// Control commands accepted by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum WatchCommand {
    Start { event_id: String },
    Stop,
    /// Stop and forget the selected event; a new `Start` is required.
    Switch,
}

/// How a dispatch ended, as recorded on the status board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Sent { http_status: u16 },
    Unauthenticated,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub kind: DispatchKind,
    pub event_id: String,
    /// Raw track name for `playing`, `None` for `stopped`.
    pub track: Option<String>,
    pub result: DispatchResult,
    pub at: DateTime<Utc>,
}
