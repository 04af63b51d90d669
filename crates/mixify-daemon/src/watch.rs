/// Watch controller: on/off state of monitoring for one selected event.
///
/// `Stopped ──start(event)──▶ Watching ──stop()──▶ Stopped`
///
/// While watching, a ticker task posts `CoreEvent::PollTick` every poll
/// interval.  Each ticker is tagged with a generation number; stopping bumps
/// the generation, so ticks that were already queued are dropped.
///
/// The controller owns the last-dispatched memory and the settle validator.
/// Only the core loop calls into it, so ticks and commands never interleave.
use std::time::{Duration, Instant};

use mixify_proto::state::{CandidateStatus, StatusBoard};
use mixify_proto::track::split_artist_title;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::CoreEvent;
use crate::dispatch::{DispatchJob, JobKind, JobSender};
use crate::probe::Probe;
use crate::settle::{SettleValidator, Verdict};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSession {
    pub selected_event_id: Option<String>,
    pub is_watching: bool,
}

pub struct WatchController<P> {
    probe: P,
    jobs: JobSender,
    board: StatusBoard,
    events: mpsc::Sender<CoreEvent>,
    poll_interval: Duration,
    session: WatchSession,
    validator: SettleValidator,
    last_dispatched: Option<String>,
    generation: u64,
    ticker: Option<AbortHandle>,
}

impl<P: Probe> WatchController<P> {
    pub fn new(
        probe: P,
        jobs: JobSender,
        board: StatusBoard,
        events: mpsc::Sender<CoreEvent>,
        poll_interval: Duration,
        settle_window: Duration,
    ) -> Self {
        Self {
            probe,
            jobs,
            board,
            events,
            poll_interval,
            session: WatchSession::default(),
            validator: SettleValidator::new(settle_window),
            last_dispatched: None,
            generation: 0,
            ticker: None,
        }
    }

    pub fn session(&self) -> &WatchSession {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_dispatched(&self) -> Option<&str> {
        self.last_dispatched.as_deref()
    }

    pub fn validator(&self) -> &SettleValidator {
        &self.validator
    }

    /// Begin watching `event_id`.  Returns `false` when already watching.
    pub async fn start(&mut self, event_id: String) -> bool {
        if self.session.is_watching {
            if self.session.selected_event_id.as_deref() != Some(event_id.as_str()) {
                warn!(
                    "start({}) ignored: already watching {:?}",
                    event_id, self.session.selected_event_id
                );
            }
            return false;
        }

        self.generation += 1;
        self.session = WatchSession {
            selected_event_id: Some(event_id.clone()),
            is_watching: true,
        };
        self.ticker = Some(spawn_ticker(
            self.events.clone(),
            self.poll_interval,
            self.generation,
        ));
        self.board.set_session(Some(event_id.clone()), true).await;
        info!(
            "watching event {} (poll {:?}, settle {:?})",
            event_id,
            self.poll_interval,
            self.validator.window()
        );
        true
    }

    /// Stop watching.  Sends one `stopped` notification if we were watching;
    /// always forgets the candidate and the last dispatched track.
    pub async fn stop(&mut self) {
        if self.session.is_watching {
            if let Some(handle) = self.ticker.take() {
                handle.abort();
            }
            self.generation += 1;
            self.session.is_watching = false;

            if let Some(event_id) = self.session.selected_event_id.clone() {
                info!("stopped watching event {}", event_id);
                self.enqueue(DispatchJob {
                    generation: self.generation,
                    event_id,
                    kind: JobKind::Stopped,
                });
            }
        }

        self.validator.reset();
        self.last_dispatched = None;
        self.board
            .set_session(self.session.selected_event_id.clone(), false)
            .await;
        self.board.clear_session_memory(false).await;
    }

    /// Stop, then forget the selected event and the held snapshot.  Watching
    /// resumes only on an explicit `start`.
    pub async fn switch_session(&mut self) {
        self.stop().await;
        self.session.selected_event_id = None;
        self.board.set_session(None, false).await;
        self.board.clear_session_memory(true).await;
    }

    /// One poll: sample the probe and feed the current track to the validator.
    pub async fn on_tick(&mut self, generation: u64, now: Instant) {
        if !self.session.is_watching || generation != self.generation {
            debug!(
                "dropping stale tick gen={} (current gen={})",
                generation, self.generation
            );
            return;
        }

        let snapshot = match self.probe.sample().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("probe unavailable: {}", e);
                self.board.set_probe_error(e.to_string()).await;
                return;
            }
        };

        if let Some(raw) = snapshot.as_ref().and_then(|s| s.current_track()) {
            let verdict = self.validator.observe(raw, now, &mut self.last_dispatched);
            match verdict {
                Verdict::Confirmed(raw_name) => self.confirm(raw_name),
                Verdict::Seeded => debug!("candidate: {}", raw),
                Verdict::Replaced { abandoned } => {
                    debug!("candidate {} replaced by {}", abandoned, raw)
                }
                Verdict::Settling { .. } | Verdict::AlreadyDispatched => {}
            }
        }

        let candidate = self.validator.candidate().map(|c| CandidateStatus {
            raw_name: c.raw_name.clone(),
            held_ms: c.held_for(now).as_millis() as u64,
        });
        self.board
            .record_sample(snapshot, candidate, self.last_dispatched.clone())
            .await;
    }

    fn confirm(&mut self, raw_name: String) {
        let Some(event_id) = self.session.selected_event_id.clone() else {
            return;
        };
        let track = split_artist_title(&raw_name);
        info!("now playing: {} / {}", track.artist, track.title);
        self.enqueue(DispatchJob {
            generation: self.generation,
            event_id,
            kind: JobKind::Playing { raw_name, track },
        });
    }

    fn enqueue(&self, job: DispatchJob) {
        if self.jobs.send(job).is_err() {
            warn!("dispatch worker gone; dropping job");
        }
    }
}

fn spawn_ticker(
    events: mpsc::Sender<CoreEvent>,
    period: Duration,
    generation: u64,
) -> AbortHandle {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick completes immediately; the first poll is one period in.
        interval.tick().await;
        loop {
            interval.tick().await;
            if events.send(CoreEvent::PollTick { generation }).await.is_err() {
                break;
            }
        }
    })
    .abort_handle()
}
