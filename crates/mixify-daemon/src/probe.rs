//! Probe client: one sample of "what is loaded right now" per tick.

use std::future::Future;
use std::path::PathBuf;

use mixify_proto::config::ProbeConfig;
use mixify_proto::protocol::ScanSnapshot;
use mixify_proto::serato::{self, ScanError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("probe task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub trait Probe: Send + Sync {
    /// `Ok(None)` is a legal "no data this tick".
    fn sample(&self) -> impl Future<Output = Result<Option<ScanSnapshot>, ProbeError>> + Send;
}

/// Reads Serato's realtime session logs.
pub struct SeratoLogProbe {
    logs_dir: PathBuf,
    history_limit: usize,
}

impl SeratoLogProbe {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            logs_dir: config.logs_dir.clone(),
            history_limit: config.history_limit,
        }
    }
}

impl Probe for SeratoLogProbe {
    async fn sample(&self) -> Result<Option<ScanSnapshot>, ProbeError> {
        let dir = self.logs_dir.clone();
        let limit = self.history_limit;
        let snapshot =
            tokio::task::spawn_blocking(move || serato::scan_latest_log(&dir, limit)).await??;
        Ok(snapshot)
    }
}
