/// CompanionCore: single-owner event loop for the watch engine.
///
/// Control commands (HTTP API, CLI autostart), poll ticks and the shutdown
/// signal all arrive as `CoreEvent`s on one channel.  The core owns the
/// `WatchController` exclusively, so state transitions run one at a time in
/// arrival order.  Dispatch reports come back from the worker on a second
/// channel and land on the status board if they belong to the live session.
use std::time::{Duration, Instant};

use mixify_proto::config::WatchConfig;
use mixify_proto::protocol::WatchCommand;
use mixify_proto::state::StatusBoard;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::dispatch::{self, Dispatch, DispatchReport};
use crate::probe::Probe;
use crate::watch::WatchController;
use crate::BroadcastMessage;

/// How long shutdown waits for queued dispatches to go out.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum CoreEvent {
    Command(WatchCommand),
    /// Poll timer fired for watch session `generation`.
    PollTick { generation: u64 },
    Shutdown,
}

pub struct CompanionCore<P> {
    controller: WatchController<P>,
    board: StatusBoard,
    reports: mpsc::UnboundedReceiver<DispatchReport>,
    worker: tokio::task::JoinHandle<()>,
}

impl<P: Probe> CompanionCore<P> {
    pub fn new<D>(
        watch: &WatchConfig,
        probe: P,
        dispatcher: D,
        board: StatusBoard,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> Self
    where
        D: Dispatch + 'static,
    {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (report_tx, reports) = mpsc::unbounded_channel();
        let worker = dispatch::spawn_worker(dispatcher, job_rx, report_tx);

        let controller = WatchController::new(
            probe,
            job_tx,
            board.clone(),
            event_tx,
            watch.poll_interval(),
            watch.settle_window(),
        );

        Self {
            controller,
            board,
            reports,
            worker,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(CoreEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event).await,
                },
                Some(report) = self.reports.recv() => self.on_report(report).await,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn handle(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Command(WatchCommand::Start { event_id }) => {
                self.controller.start(event_id).await;
            }
            CoreEvent::Command(WatchCommand::Stop) => self.controller.stop().await,
            CoreEvent::Command(WatchCommand::Switch) => self.controller.switch_session().await,
            CoreEvent::PollTick { generation } => {
                self.controller.on_tick(generation, Instant::now()).await
            }
            CoreEvent::Shutdown => {}
        }
    }

    async fn on_report(&self, report: DispatchReport) {
        if report.generation != self.controller.generation() {
            debug!(
                "ignoring {:?} report from session gen={}",
                report.record.kind, report.generation
            );
            return;
        }
        self.board.record_dispatch(report.record).await;
    }

    async fn shutdown(self) {
        info!("shutting down");
        let Self {
            mut controller,
            worker,
            ..
        } = self;
        controller.stop().await;
        // Dropping the controller closes the job queue so the worker can finish
        drop(controller);
        if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
            warn!("dispatch queue not drained within {:?}", DRAIN_TIMEOUT);
        }
    }
}

/// Copy forwarded warning/error lines onto the status board.
pub fn spawn_log_forwarder(
    mut rx: broadcast::Receiver<BroadcastMessage>,
    board: StatusBoard,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(BroadcastMessage::Log(line)) => board.push_log(line).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("log forwarder lagged by {} lines", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchError, DispatchOutcome};
    use crate::probe::ProbeError;
    use mixify_proto::protocol::{DispatchKind, DispatchResult, ScanSnapshot, TrackInfo};
    use reqwest::StatusCode;
    use std::sync::{Arc, Mutex};

    struct FixedProbe(&'static str);

    impl Probe for FixedProbe {
        async fn sample(&self) -> Result<Option<ScanSnapshot>, ProbeError> {
            Ok(Some(ScanSnapshot {
                file_name: "live.log".into(),
                found_tracks: vec![self.0.to_string()],
            }))
        }
    }

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
            self.calls
                .lock()
                .unwrap()
                .push(format!("playing {event_id} {}|{}", track.artist, track.title));
            Ok(DispatchOutcome::Sent {
                status: StatusCode::OK,
                body: serde_json::Value::Null,
            })
        }

        async fn send_stop(&self, event_id: &str) -> Result<DispatchOutcome, DispatchError> {
            self.calls.lock().unwrap().push(format!("stop {event_id}"));
            Ok(DispatchOutcome::Unauthenticated)
        }
    }

    /// `send_playing` takes a while, so a `Stop` can overtake it.
    #[derive(Default, Clone)]
    struct SlowPlaying {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Dispatch for SlowPlaying {
        async fn send_playing(
            &self,
            event_id: &str,
            _track: &TrackInfo,
        ) -> Result<DispatchOutcome, DispatchError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.calls.lock().unwrap().push(format!("playing {event_id}"));
            Ok(DispatchOutcome::Sent {
                status: StatusCode::OK,
                body: serde_json::Value::Null,
            })
        }

        async fn send_stop(&self, event_id: &str) -> Result<DispatchOutcome, DispatchError> {
            self.calls.lock().unwrap().push(format!("stop {event_id}"));
            Ok(DispatchOutcome::Sent {
                status: StatusCode::OK,
                body: serde_json::Value::Null,
            })
        }
    }

    fn fast_watch() -> WatchConfig {
        WatchConfig {
            poll_interval_ms: 10,
            settle_window_ms: 0,
        }
    }

    async fn wait_for<F: Fn(&mixify_proto::state::WatchStatus) -> bool>(
        board: &StatusBoard,
        pred: F,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if pred(&board.get().await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition within timeout");
    }

    #[tokio::test]
    async fn test_end_to_end_playing_then_shutdown_stop() {
        let recorder = Recorder::default();
        let board = StatusBoard::new();
        let (event_tx, event_rx) = mpsc::channel(64);
        let core = CompanionCore::new(
            &fast_watch(),
            FixedProbe("Daft Punk - One More Time"),
            recorder.clone(),
            board.clone(),
            event_tx.clone(),
        );
        let handle = tokio::spawn(core.run(event_rx));

        event_tx
            .send(CoreEvent::Command(WatchCommand::Start {
                event_id: "evt".into(),
            }))
            .await
            .unwrap();

        wait_for(&board, |s| s.last_dispatch.is_some()).await;
        let record = board.get().await.last_dispatch.unwrap();
        assert_eq!(record.kind, DispatchKind::Playing);
        assert_eq!(record.result, DispatchResult::Sent { http_status: 200 });

        event_tx.send(CoreEvent::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["playing evt Daft Punk|One More Time", "stop evt"]
        );
    }

    #[tokio::test]
    async fn test_stop_command_reports_stopped() {
        let recorder = Recorder::default();
        let board = StatusBoard::new();
        let (event_tx, event_rx) = mpsc::channel(64);
        let core = CompanionCore::new(
            &WatchConfig {
                poll_interval_ms: 3_600_000,
                settle_window_ms: 15_000,
            },
            FixedProbe("A"),
            recorder.clone(),
            board.clone(),
            event_tx.clone(),
        );
        let handle = tokio::spawn(core.run(event_rx));

        for cmd in [
            WatchCommand::Start {
                event_id: "evt".into(),
            },
            WatchCommand::Stop,
            WatchCommand::Stop,
        ] {
            event_tx.send(CoreEvent::Command(cmd)).await.unwrap();
        }

        wait_for(&board, |s| s.last_dispatch.is_some()).await;
        let status = board.get().await;
        assert!(!status.is_watching);
        let record = status.last_dispatch.unwrap();
        assert_eq!(record.kind, DispatchKind::Stopped);
        assert_eq!(record.result, DispatchResult::Unauthenticated);

        event_tx.send(CoreEvent::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
        // Second stop and shutdown while stopped add nothing
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["stop evt"]);
    }

    #[tokio::test]
    async fn test_report_from_previous_session_is_ignored() {
        let dispatcher = SlowPlaying::default();
        let board = StatusBoard::new();
        let (event_tx, event_rx) = mpsc::channel(64);
        let core = CompanionCore::new(
            &fast_watch(),
            FixedProbe("A - B"),
            dispatcher.clone(),
            board.clone(),
            event_tx.clone(),
        );
        let handle = tokio::spawn(core.run(event_rx));

        event_tx
            .send(CoreEvent::Command(WatchCommand::Start {
                event_id: "evt".into(),
            }))
            .await
            .unwrap();
        // Confirmed and queued, but the send is still in flight
        wait_for(&board, |s| s.last_dispatched.is_some()).await;
        event_tx
            .send(CoreEvent::Command(WatchCommand::Stop))
            .await
            .unwrap();

        // The playing report arrives first and must not reach the board
        wait_for(&board, |s| s.last_dispatch.is_some()).await;
        let record = board.get().await.last_dispatch.unwrap();
        assert_eq!(record.kind, DispatchKind::Stopped);

        event_tx.send(CoreEvent::Shutdown).await.unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(
            *dispatcher.calls.lock().unwrap(),
            vec!["playing evt", "stop evt"]
        );
        assert_eq!(
            board.get().await.last_dispatch.map(|r| r.kind),
            Some(DispatchKind::Stopped)
        );
    }

    #[tokio::test]
    async fn test_log_forwarder_fills_board() {
        let (tx, rx) = broadcast::channel(8);
        let board = StatusBoard::new();
        let handle = spawn_log_forwarder(rx, board.clone());
        tx.send(BroadcastMessage::Log("12:00:00 [WARN] probe unavailable".into()))
            .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(board.get().await.recent_logs.len(), 1);
    }
}
