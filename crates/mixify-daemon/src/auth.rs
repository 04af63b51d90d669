/// Credential capability used by the dispatch client.
///
/// The login flow and token refresh live in the external identity client.
/// It keeps the current session in a JSON file, which we re-read before
/// every send so a refreshed token is picked up without restarting.
use std::path::PathBuf;

use chrono::Utc;
use mixify_proto::protocol::Credential;
use tracing::debug;

pub trait CredentialProvider: Send + Sync {
    /// A currently valid credential, or `None` when not signed in.
    fn current_credential(&self) -> Option<Credential>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<Credential> + Send + Sync,
{
    fn current_credential(&self) -> Option<Credential> {
        self()
    }
}

pub struct SessionFileProvider {
    path: PathBuf,
}

impl SessionFileProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl CredentialProvider for SessionFileProvider {
    fn current_credential(&self) -> Option<Credential> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| debug!("session file {:?} unreadable: {}", self.path, e))
            .ok()?;
        let credential: Credential = serde_json::from_str(&content)
            .map_err(|e| debug!("session file {:?} malformed: {}", self.path, e))
            .ok()?;
        if !credential.is_valid_at(Utc::now()) {
            debug!("session in {:?} is empty or expired", self.path);
            return None;
        }
        Some(credential)
    }
}
