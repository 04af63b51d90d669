//! Serato realtime log scanning.
//!
//! Serato DJ appends a line to its current session log whenever a file is
//! loaded onto a deck.  We pick the most recently modified `*.log` in the
//! logs directory, pull every audio file name out of it in order and keep
//! the tail.  The last entry is the track currently loaded.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::debug;

use crate::protocol::ScanSnapshot;

pub const AUDIO_EXTENSIONS: [&str; 5] = [".mp3", ".wav", ".flac", ".aiff", ".m4a"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Serato logs directory does not exist: {0}")]
    LogsDirMissing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scan `logs_dir` and return the last `history_limit` loaded tracks of the
/// newest log.  `Ok(None)` means there is no log file yet.
pub fn scan_latest_log(
    logs_dir: &Path,
    history_limit: usize,
) -> Result<Option<ScanSnapshot>, ScanError> {
    if !logs_dir.is_dir() {
        return Err(ScanError::LogsDirMissing(logs_dir.to_path_buf()));
    }

    let Some(log_path) = newest_log(logs_dir)? else {
        debug!("no .log file in {:?}", logs_dir);
        return Ok(None);
    };

    let content = std::fs::read(&log_path).map_err(|source| ScanError::Io {
        path: log_path.clone(),
        source,
    })?;
    let content = String::from_utf8_lossy(&content);

    let mut found_tracks = extract_tracks(&content);
    let start = found_tracks.len().saturating_sub(history_limit);
    found_tracks.drain(..start);

    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Some(ScanSnapshot {
        file_name,
        found_tracks,
    }))
}

fn newest_log(dir: &Path) -> Result<Option<PathBuf>, ScanError> {
    let io_err = |source| ScanError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "log") {
            continue;
        }
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if latest.as_ref().map_or(true, |(t, _)| modified > *t) {
            latest = Some((modified, path));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

/// Pull loaded track names out of log text, in order, collapsing
/// consecutive repeats of the same name.
pub fn extract_tracks(content: &str) -> Vec<String> {
    let mut tracks: Vec<String> = Vec::new();
    for line in content.lines() {
        let Some(name) = track_name_in_line(line) else {
            continue;
        };
        if tracks.last() != Some(&name) {
            tracks.push(name);
        }
    }
    tracks
}

fn track_name_in_line(line: &str) -> Option<String> {
    let ext_idx = AUDIO_EXTENSIONS.iter().find_map(|ext| line.find(ext))?;
    let head = &line[..ext_idx];
    let slash_idx = head.rfind(['/', '\\'])?;
    let name = head[slash_idx + 1..].replace("%20", " ").trim().to_string();
    (!name.is_empty()).then_some(name)
}
