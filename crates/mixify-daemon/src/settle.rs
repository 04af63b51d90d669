/// Settle validator: decides when a loaded track is really playing.
///
/// DJs load and cue tracks they never play.  A track only counts as
/// "now playing" once the same raw name has been the current track for the
/// whole settle window, timed from its first sighting.
///
/// ```text
///   Idle ──r──▶ Candidate(r, now) ──same r, held ≥ window──▶ Confirmed(r) ──▶ Idle
///                  │    ▲
///                  └────┘  different r: restart clock
/// ```
///
/// The validator holds no timer.  The caller feeds it one observation per
/// tick together with the tick's timestamp, and owns the last-dispatched
/// memory, which is passed in by `&mut` and updated on confirmation.
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub raw_name: String,
    pub first_seen: Instant,
}

impl Candidate {
    pub fn held_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen)
    }
}

/// Result of feeding one observation to the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Same as the last dispatched track; nothing to do.
    AlreadyDispatched,
    /// New candidate started with no previous one.
    Seeded,
    /// New candidate replaced a different one before it settled.
    Replaced { abandoned: String },
    /// Candidate still inside the settle window.
    Settling { elapsed: Duration },
    /// Candidate held for the full window; dispatch it.
    Confirmed(String),
}

#[derive(Debug)]
pub struct SettleValidator {
    window: Duration,
    candidate: Option<Candidate>,
}

impl SettleValidator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            candidate: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    pub fn reset(&mut self) {
        self.candidate = None;
    }

    pub fn observe(
        &mut self,
        raw: &str,
        now: Instant,
        last_dispatched: &mut Option<String>,
    ) -> Verdict {
        if last_dispatched.as_deref() == Some(raw) {
            self.candidate = None;
            return Verdict::AlreadyDispatched;
        }

        match self.candidate.take() {
            Some(candidate) if candidate.raw_name == raw => {
                let elapsed = candidate.held_for(now);
                if elapsed >= self.window {
                    *last_dispatched = Some(candidate.raw_name.clone());
                    Verdict::Confirmed(candidate.raw_name)
                } else {
                    self.candidate = Some(candidate);
                    Verdict::Settling { elapsed }
                }
            }
            previous => {
                self.candidate = Some(Candidate {
                    raw_name: raw.to_string(),
                    first_seen: now,
                });
                match previous {
                    Some(old) => Verdict::Replaced {
                        abandoned: old.raw_name,
                    },
                    None => Verdict::Seeded,
                }
            }
        }
    }
}
