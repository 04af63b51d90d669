/// Dispatch client and single-flight dispatch worker.
///
/// ```text
///   WatchController ──DispatchJob──▶ mpsc ──▶ worker task ──POST──▶ track-update endpoint
///                                               │
///   CompanionCore ◀────DispatchReport───────────┘
/// ```
///
/// The tick path only enqueues jobs, it never awaits the network.  The worker
/// sends one job at a time, in order.  A failed send is logged and reported,
/// nothing else: the engine already considers the track dispatched.
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use mixify_proto::config::DispatchConfig;
use mixify_proto::protocol::{
    DispatchKind, DispatchRecord, DispatchResult, TrackInfo, TrackUpdate,
};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::CredentialProvider;

/// Upper bound for a single retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint rejected update with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

impl DispatchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status, .. } => status.is_server_error(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Sent { status: StatusCode, body: Value },
    /// No credential available; nothing was sent.
    Unauthenticated,
}

pub trait Dispatch: Send + Sync {
    fn send_playing(
        &self,
        event_id: &str,
        track: &TrackInfo,
    ) -> impl Future<Output = Result<DispatchOutcome, DispatchError>> + Send;

    fn send_stop(
        &self,
        event_id: &str,
    ) -> impl Future<Output = Result<DispatchOutcome, DispatchError>> + Send;
}

// ── HTTP client ───────────────────────────────────────────────────────────────

pub struct DispatchClient<C> {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    source: String,
    max_retries: u32,
    retry_backoff: Duration,
    credentials: C,
}

impl<C: CredentialProvider> DispatchClient<C> {
    pub fn new(config: &DispatchConfig, credentials: C) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            source: config.source.clone(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            credentials,
        })
    }

    async fn post(&self, update: &TrackUpdate) -> Result<DispatchOutcome, DispatchError> {
        let mut attempt = 0u32;
        loop {
            match self.post_once(update).await {
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    let delay = backoff_delay(self.retry_backoff, attempt);
                    warn!(
                        "dispatch {:?} attempt {} failed: {}; retrying in {:?}",
                        update.kind(),
                        attempt + 1,
                        e,
                        delay
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn post_once(&self, update: &TrackUpdate) -> Result<DispatchOutcome, DispatchError> {
        let Some(credential) = self.credentials.current_credential() else {
            debug!("dispatch {:?} skipped: not signed in", update.kind());
            return Ok(DispatchOutcome::Unauthenticated);
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&credential.access_token)
            .header("apikey", &self.api_key)
            .json(update)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(DispatchError::Rejected { status, body: text });
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(DispatchOutcome::Sent { status, body })
    }
}

/// `base * 2^attempt`, capped at `MAX_RETRY_DELAY`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(attempt))
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

impl<C: CredentialProvider> Dispatch for DispatchClient<C> {
    async fn send_playing(
        &self,
        event_id: &str,
        track: &TrackInfo,
    ) -> Result<DispatchOutcome, DispatchError> {
        let update = TrackUpdate::Playing {
            event_id: event_id.to_string(),
            track_name: track.title.clone(),
            track_artist: track.artist.clone(),
            source: self.source.clone(),
        };
        self.post(&update).await
    }

    async fn send_stop(&self, event_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let update = TrackUpdate::Stopped {
            event_id: event_id.to_string(),
        };
        self.post(&update).await
    }
}

// ── worker ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    Playing { raw_name: String, track: TrackInfo },
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    /// Watch session the job belongs to.
    pub generation: u64,
    pub event_id: String,
    pub kind: JobKind,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub generation: u64,
    pub record: DispatchRecord,
}

pub type JobSender = mpsc::UnboundedSender<DispatchJob>;

pub fn spawn_worker<D>(
    dispatcher: D,
    mut jobs: mpsc::UnboundedReceiver<DispatchJob>,
    reports: mpsc::UnboundedSender<DispatchReport>,
) -> tokio::task::JoinHandle<()>
where
    D: Dispatch + 'static,
{
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let report = run_job(&dispatcher, job).await;
            let _ = reports.send(report);
        }
        debug!("dispatch worker: queue closed");
    })
}

async fn run_job<D: Dispatch>(dispatcher: &D, job: DispatchJob) -> DispatchReport {
    let (kind, track, result) = match &job.kind {
        JobKind::Playing { raw_name, track } => (
            DispatchKind::Playing,
            Some(raw_name.clone()),
            dispatcher.send_playing(&job.event_id, track).await,
        ),
        JobKind::Stopped => (
            DispatchKind::Stopped,
            None,
            dispatcher.send_stop(&job.event_id).await,
        ),
    };

    let result = match result {
        Ok(DispatchOutcome::Sent { status, body }) => {
            info!("dispatch {:?} for event {} -> {} {}", kind, job.event_id, status, body);
            DispatchResult::Sent {
                http_status: status.as_u16(),
            }
        }
        Ok(DispatchOutcome::Unauthenticated) => DispatchResult::Unauthenticated,
        Err(e) => {
            warn!("dispatch {:?} for event {} failed: {}", kind, job.event_id, e);
            DispatchResult::Failed {
                error: e.to_string(),
            }
        }
    };

    DispatchReport {
        generation: job.generation,
        record: DispatchRecord {
            kind,
            event_id: job.event_id,
            track,
            result,
            at: Utc::now(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use mixify_proto::protocol::Credential;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Seen = Arc<Mutex<Vec<(HeaderMap, Value)>>>;

    async fn record(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        seen.lock().unwrap().push((headers, body));
        Json(json!({ "ok": true }))
    }

    async fn fail(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, String) {
        seen.lock().unwrap().push((headers, body));
        (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
    }

    async fn reject(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, String) {
        seen.lock().unwrap().push((headers, body));
        (StatusCode::BAD_REQUEST, "bad event".to_string())
    }

    /// Mock track-update endpoint on an ephemeral port.
    async fn mock_endpoint() -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route("/update", post(record))
            .route("/broken", post(fail))
            .route("/rejected", post(reject))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn signed_in() -> Option<Credential> {
        Some(Credential {
            access_token: "token-123".into(),
            expires_at: None,
        })
    }

    fn signed_out() -> Option<Credential> {
        None
    }

    fn config(endpoint: String) -> DispatchConfig {
        DispatchConfig {
            endpoint,
            api_key: "anon-key".into(),
            retry_backoff_ms: 1,
            ..DispatchConfig::default()
        }
    }

    #[tokio::test]
    async fn test_playing_request_shape() {
        let (base, seen) = mock_endpoint().await;
        let client = DispatchClient::new(&config(format!("{base}/update")), signed_in).unwrap();
        let track = TrackInfo {
            artist: "Daft Punk".into(),
            title: "One More Time".into(),
        };

        let outcome = client.send_playing("evt-9", &track).await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Sent {
                status: StatusCode::OK,
                body: json!({ "ok": true })
            }
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (headers, body) = &seen[0];
        assert_eq!(headers["authorization"], "Bearer token-123");
        assert_eq!(headers["apikey"], "anon-key");
        assert_eq!(headers["content-type"], "application/json");
        assert_eq!(
            body,
            &json!({
                "event_id": "evt-9",
                "track_name": "One More Time",
                "track_artist": "Daft Punk",
                "source": "serato",
                "action": "playing",
            })
        );
    }

    #[tokio::test]
    async fn test_stop_request_shape() {
        let (base, seen) = mock_endpoint().await;
        let client = DispatchClient::new(&config(format!("{base}/update")), signed_in).unwrap();
        client.send_stop("evt-9").await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].1, json!({ "event_id": "evt-9", "action": "stopped" }));
    }

    #[tokio::test]
    async fn test_unauthenticated_sends_nothing() {
        let (base, seen) = mock_endpoint().await;
        let client = DispatchClient::new(&config(format!("{base}/update")), signed_out).unwrap();
        let outcome = client.send_stop("evt-9").await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Unauthenticated);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried_by_default() {
        let (base, seen) = mock_endpoint().await;
        let client = DispatchClient::new(&config(format!("{base}/broken")), signed_in).unwrap();
        let err = client.send_stop("evt-9").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Rejected { status, .. } if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bounded_retry() {
        let (base, seen) = mock_endpoint().await;
        let cfg = DispatchConfig {
            max_retries: 2,
            ..config(format!("{base}/broken"))
        };
        let client = DispatchClient::new(&cfg, signed_in).unwrap();
        assert!(client.send_stop("evt-9").await.is_err());
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_never_retried() {
        let (base, seen) = mock_endpoint().await;
        let cfg = DispatchConfig {
            max_retries: 3,
            ..config(format!("{base}/rejected"))
        };
        let client = DispatchClient::new(&cfg, signed_in).unwrap();
        let err = client.send_stop("evt-9").await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Rejected { status, ref body }
                if status == StatusCode::BAD_REQUEST && body == "bad event"
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_is_capped() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 20), MAX_RETRY_DELAY);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX), 1), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client =
            DispatchClient::new(&config(format!("http://{addr}/update")), signed_in).unwrap();
        let err = client.send_stop("evt-9").await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }

    /// Records calls in order; `send_stop` fails to exercise error reports.
    #[derive(Default, Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Dispatch for Recorder {
        async fn send_playing(
            &self,
            event_id: &str,
            track: &TrackInfo,
        ) -> Result<DispatchOutcome, DispatchError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.calls
                .lock()
                .unwrap()
                .push(format!("playing {event_id} {}", track.title));
            Ok(DispatchOutcome::Sent {
                status: StatusCode::OK,
                body: Value::Null,
            })
        }

        async fn send_stop(&self, event_id: &str) -> Result<DispatchOutcome, DispatchError> {
            self.calls.lock().unwrap().push(format!("stop {event_id}"));
            Err(DispatchError::Rejected {
                status: StatusCode::BAD_GATEWAY,
                body: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_in_order_and_reports() {
        let recorder = Recorder::default();
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(recorder.clone(), job_rx, report_tx);

        job_tx
            .send(DispatchJob {
                generation: 1,
                event_id: "e".into(),
                kind: JobKind::Playing {
                    raw_name: "A - B".into(),
                    track: TrackInfo {
                        artist: "A".into(),
                        title: "B".into(),
                    },
                },
            })
            .unwrap();
        job_tx
            .send(DispatchJob {
                generation: 1,
                event_id: "e".into(),
                kind: JobKind::Stopped,
            })
            .unwrap();
        drop(job_tx);
        worker.await.unwrap();

        assert_eq!(*recorder.calls.lock().unwrap(), vec!["playing e B", "stop e"]);

        let first = report_rx.recv().await.unwrap();
        assert_eq!(first.record.kind, DispatchKind::Playing);
        assert_eq!(first.record.track.as_deref(), Some("A - B"));
        assert_eq!(first.record.result, DispatchResult::Sent { http_status: 200 });

        let second = report_rx.recv().await.unwrap();
        assert_eq!(second.record.kind, DispatchKind::Stopped);
        assert!(matches!(second.record.result, DispatchResult::Failed { .. }));
    }
}
