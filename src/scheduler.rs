//! Cooperative monitor scheduler
//!
//! One loop, no thread per monitor. Each one-second tick classifies every
//! monitor's urgency from trigger proximity and activity, selects the
//! monitors whose deadline passed, and dispatches passes through a global
//! semaphore sized adaptively to the critical load. Per-monitor exclusion is
//! the record mutex inside the engine; the scheduler never runs two passes
//! for one monitor concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{Engine, PassOutcome};
use crate::monitor::MonitorRecord;
use crate::types::{Money, Phase, Urgency};

use chrono::{Duration as ChronoDuration, Utc};

/// Trigger-distance thresholds, as fractions of the mark price.
const CRITICAL_DISTANCE: &str = "0.01";
const URGENT_DISTANCE: &str = "0.03";

/// Recent-activity window that keeps a monitor in the ACTIVE class.
const ACTIVITY_WINDOW_SECS: i64 = 60;

/// Monitor count past which non-critical intervals widen.
const SCALE_THRESHOLD: usize = 100;
const SCALE_MULTIPLIER: u32 = 2;

/// Non-critical interval multiplier while execution mode is active.
const EXECUTION_MULTIPLIER: u32 = 2;

/// Bounds for the adaptive pass gate.
const MIN_CONCURRENT_PASSES: usize = 10;
const MAX_CONCURRENT_PASSES: usize = 20;

/// Classify one monitor's urgency from trigger proximity, phase, and
/// recency of activity.
pub fn classify_urgency(
    record: &MonitorRecord,
    trigger_distance: Option<Money>,
    now: chrono::DateTime<chrono::Utc>,
) -> Urgency {
    let critical: Money = CRITICAL_DISTANCE.parse().expect("const distance");
    let urgent: Money = URGENT_DISTANCE.parse().expect("const distance");

    if let Some(distance) = trigger_distance {
        if distance <= critical {
            return Urgency::Critical;
        }
        if distance <= urgent {
            return Urgency::Urgent;
        }
    }

    let idle = now.signed_duration_since(record.last_event_ts);
    let recently_active = idle <= ChronoDuration::seconds(ACTIVITY_WINDOW_SECS);

    if record.phase == Phase::ProfitTaking || recently_active {
        return Urgency::Active;
    }
    if record.phase == Phase::Building {
        return Urgency::Building;
    }
    if idle > ChronoDuration::minutes(30) {
        return Urgency::Dormant;
    }
    if idle > ChronoDuration::minutes(10) {
        return Urgency::Stable;
    }
    Urgency::Active
}

/// Due interval for an urgency class, widened under monitor-count pressure
/// and execution mode. CRITICAL stays at its configured floor no matter
/// what.
pub fn due_interval(
    config: &Config,
    urgency: Urgency,
    total_monitors: usize,
    execution_mode: bool,
) -> Duration {
    let base = config.interval_for(urgency);
    if urgency == Urgency::Critical {
        return base;
    }
    let mut multiplier = 1u32;
    if total_monitors > SCALE_THRESHOLD {
        multiplier *= SCALE_MULTIPLIER;
    }
    if execution_mode {
        multiplier *= EXECUTION_MULTIPLIER;
    }
    base * multiplier
}

/// Target size of the pass gate for the current critical load.
pub fn gate_target(configured: usize, critical_count: usize) -> usize {
    let base = configured.clamp(MIN_CONCURRENT_PASSES, MAX_CONCURRENT_PASSES);
    (base + critical_count).clamp(MIN_CONCURRENT_PASSES, MAX_CONCURRENT_PASSES)
}

/// Semaphore wrapper that can grow and shrink between ticks.
struct AdaptiveGate {
    semaphore: Arc<Semaphore>,
    size: AtomicUsize,
}

impl AdaptiveGate {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size: AtomicUsize::new(size),
        }
    }

    fn resize(&self, target: usize) {
        let current = self.size.load(Ordering::Relaxed);
        if target > current {
            self.semaphore.add_permits(target - current);
            self.size.store(target, Ordering::Relaxed);
        } else if target < current {
            // Shrink best-effort: burn whatever idle permits are available.
            let mut burned = 0;
            while burned < current - target {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        burned += 1;
                    }
                    Err(_) => break,
                }
            }
            self.size.store(current - burned, Ordering::Relaxed);
        }
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
    gate: AdaptiveGate,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        let gate = AdaptiveGate::new(
            engine
                .config()
                .max_concurrent_monitors
                .clamp(MIN_CONCURRENT_PASSES, MAX_CONCURRENT_PASSES),
        );
        Self { engine, gate }
    }

    /// Main loop. Returns after a shutdown signal once in-flight passes
    /// drain (bounded) and persistence flushes.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) {
        let config = self.engine.config();
        let mut tick = interval(Duration::from_secs(1));
        let mut reconcile_tick = interval(Duration::from_secs(60));
        let mut flush_tick = interval(config.persistence_batch_interval);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!("scheduler started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.engine.maintain_execution_mode();
                    self.dispatch_due(&mut in_flight).await;
                    // Reap finished passes so the set stays bounded.
                    while in_flight.try_join_next().is_some() {}
                }
                _ = reconcile_tick.tick() => {
                    self.engine.reconcile().await;
                }
                _ = flush_tick.tick() => {
                    if self.engine.store().is_dirty() {
                        self.engine.store().flush();
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        // Drain in-flight passes with a bounded wait, then flush.
        let drain = config.shutdown_drain;
        if timeout(drain, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("shutdown drain exceeded {:?}; abandoning passes", drain);
            in_flight.abort_all();
        }
        self.engine.persist(true).await;
        self.engine.store().flush();
        info!("scheduler stopped");
    }

    /// One tick: classify urgency for every monitor, then dispatch the due
    /// ones ordered by urgency and deadline.
    async fn dispatch_due(&self, in_flight: &mut JoinSet<()>) {
        let config = self.engine.config();
        let now = Utc::now();
        let keys = self.engine.monitor_keys().await;
        let total = keys.len();
        if total == 0 {
            return;
        }
        let execution_mode = self.engine.execution_mode_active();

        let mut critical_count = 0usize;
        let mut due: Vec<(Urgency, chrono::DateTime<chrono::Utc>, String)> = Vec::new();

        for key in keys {
            let Some(record_arc) = self.engine.monitor_arc(&key).await else {
                continue;
            };
            // A record mid-pass keeps its previous classification.
            let Ok(mut record) = record_arc.try_lock() else {
                continue;
            };
            if record.is_closed() {
                continue;
            }

            let mark = self
                .engine
                .cache()
                .peek(record.account)
                .await
                .and_then(|snapshot| {
                    snapshot
                        .position_for(&record.symbol, record.side)
                        .map(|p| p.mark_price)
                });
            let distance = mark.and_then(|m| record.nearest_trigger_distance(m));
            let urgency = classify_urgency(&record, distance, now);
            record.urgency = urgency;
            if urgency == Urgency::Critical {
                critical_count += 1;
            }

            if record.next_due_at <= now {
                due.push((urgency, record.next_due_at, key));
            }
        }

        self.engine.cache().set_critical_pressure(critical_count);
        self.gate
            .resize(gate_target(config.max_concurrent_monitors, critical_count));

        due.sort();
        for (urgency, _, key) in due {
            let engine = Arc::clone(&self.engine);
            let semaphore = Arc::clone(&self.gate.semaphore);
            let pass_timeout = config.pass_timeout;
            let interval_now =
                due_interval(engine.config(), urgency, total, execution_mode);

            in_flight.spawn(async move {
                let Ok(permit) = semaphore.acquire_owned().await else {
                    return;
                };

                let (next_urgency, next_interval) =
                    match timeout(pass_timeout, engine.run_monitor_pass(&key)).await {
                        Ok(Ok(PassOutcome::Removed)) => {
                            drop(permit);
                            return;
                        }
                        Ok(Ok(PassOutcome::Activity)) => {
                            let i = due_interval(
                                engine.config(),
                                Urgency::Active,
                                0,
                                engine.execution_mode_active(),
                            );
                            (Some(Urgency::Active), i)
                        }
                        Ok(Ok(PassOutcome::Idle)) => (None, interval_now),
                        Ok(Err(e)) => {
                            error!(monitor = %key, "monitor pass failed: {:#}", e);
                            (None, interval_now)
                        }
                        Err(_) => {
                            // Wall-clock ceiling exceeded: reschedule hot.
                            warn!(monitor = %key, "pass exceeded {:?}; rescheduling URGENT", pass_timeout);
                            let i = due_interval(
                                engine.config(),
                                Urgency::Urgent,
                                0,
                                engine.execution_mode_active(),
                            );
                            (Some(Urgency::Urgent), i)
                        }
                    };
                drop(permit);

                if let Some(record_arc) = engine.monitor_arc(&key).await {
                    if let Ok(mut record) = record_arc.try_lock() {
                        if let Some(u) = next_urgency {
                            record.urgency = u;
                        }
                        record.next_due_at = Utc::now()
                            + ChronoDuration::from_std(next_interval)
                                .unwrap_or_else(|_| ChronoDuration::seconds(60));
                    }
                }
                debug!(monitor = %key, "pass complete");
            });
        }
    }
}
