//! Background supervision of tracked workers.
//!
//! One loop, fixed cadence, no audit records: supervision is bookkeeping,
//! not a caller-initiated mutation. It writes status flips and last-seen
//! bumps into `workers.json`; the change watcher turns those into events.
//!
//! A worker whose process is gone becomes `dead`. A worker whose process is
//! alive but silent past the threshold becomes `stuck`, and recovers to
//! `running` as soon as activity resumes. Each liveness probe is bounded by
//! its own timeout so one wedged process cannot stall the rest of the sweep.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{ProcessTracker, WorkerStatus};
use crate::errors::EngineError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_STUCK_AFTER: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Supervisor {
    tracker: ProcessTracker,
    poll_interval: Duration,
    stuck_after: Duration,
    probe_timeout: Duration,
}

impl Supervisor {
    pub fn new(tracker: ProcessTracker) -> Self {
        Self {
            tracker,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stuck_after: DEFAULT_STUCK_AFTER,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_cadence(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(10));
        self
    }

    pub fn with_stuck_after(mut self, stuck_after: Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Sweep until the shutdown signal flips (or its sender goes away).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(%err, "supervision sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("supervision loop stopped");
    }

    /// One pass over the registry: probe liveness, age activity, apply the
    /// resulting flips in a single registry write.
    pub async fn sweep(&self) -> Result<(), EngineError> {
        let workers = self.tracker.workers()?;
        let now = Utc::now();
        let mut seen: Vec<String> = Vec::new();
        let mut flips: Vec<(String, WorkerStatus)> = Vec::new();

        for (id, record) in &workers {
            if record.is_terminal() {
                continue;
            }
            let Some(pid) = record.pid else {
                continue;
            };

            let alive = match tokio::time::timeout(
                self.probe_timeout,
                self.tracker.probe.alive(pid),
            )
            .await
            {
                Ok(alive) => alive,
                Err(_) => {
                    warn!(worker = %id, pid, "liveness probe timed out, skipping this round");
                    continue;
                }
            };

            if !alive {
                warn!(worker = %id, pid, "process vanished without a handoff");
                flips.push((id.clone(), WorkerStatus::Dead));
                continue;
            }
            seen.push(id.clone());

            let idle = now
                .signed_duration_since(record.activity_anchor())
                .to_std()
                .unwrap_or(Duration::ZERO);
            let next = if idle >= self.stuck_after {
                WorkerStatus::Stuck
            } else {
                WorkerStatus::Running
            };
            if next != record.status {
                if next == WorkerStatus::Stuck {
                    warn!(worker = %id, idle_secs = idle.as_secs(), "worker is stuck");
                } else {
                    debug!(worker = %id, "worker recovered from stuck");
                }
                flips.push((id.clone(), next));
            }
        }

        if seen.is_empty() && flips.is_empty() {
            return Ok(());
        }
        self.tracker.store.update_workers(None, |workers| {
            for id in &seen {
                if let Some(record) = workers.get_mut(id) {
                    if !record.is_terminal() {
                        record.last_seen = Some(now);
                    }
                }
            }
            for (id, next) in &flips {
                if let Some(record) = workers.get_mut(id) {
                    // A kill or completion that landed mid-sweep wins.
                    if record.is_terminal() {
                        continue;
                    }
                    record.status = *next;
                    if next.is_terminal() {
                        record.completed_at = Some(now);
                    }
                }
            }
        })?;
        Ok(())
    }
}
