//! Scan scheduler
//!
//! Single consumer of unit triggers. Triggers from the watcher, the initial
//! discovery and the periodic sweep arrive on one mpsc channel, are
//! normalized to unit paths and admitted into a FIFO queue. Exactly one scan
//! runs at a time; the loop keeps admitting triggers while it does.

use crate::services::scanner::UnitScan;
use crate::services::units::{discover_units, normalize_unit_path, unit_key};
use chrono::Utc;
use medlog_common::events::{AgentEvent, EventBus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

/// A unit re-triggered within this window after its last admission is dropped
pub const DEFAULT_UNIT_DEBOUNCE: Duration = Duration::from_secs(30);

/// Sweep depth is clamped to this range
const SWEEP_DEPTH_RANGE: (usize, usize) = (1, 4);

/// Result of offering a trigger to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Path does not reduce to a unit
    Invalid,
    DuplicateQueued,
    Debounced,
    Queued(PathBuf),
}

/// FIFO of unit paths with dedup, debounce and the in-flight marker
#[derive(Debug)]
pub struct ScanQueue {
    queue: VecDeque<PathBuf>,
    queued_keys: HashSet<String>,
    in_flight: Option<String>,
    last_admitted: HashMap<String, Instant>,
    debounce: Duration,
}

impl ScanQueue {
    pub fn new(debounce: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_keys: HashSet::new(),
            in_flight: None,
            last_admitted: HashMap::new(),
            debounce,
        }
    }

    pub fn admit(&mut self, trigger: &Path, now: Instant) -> Admission {
        let Some(unit) = normalize_unit_path(trigger) else {
            return Admission::Invalid;
        };
        let key = unit_key(&unit);

        if self.queued_keys.contains(&key) {
            return Admission::DuplicateQueued;
        }
        if let Some(last) = self.last_admitted.get(&key) {
            if now.saturating_duration_since(*last) < self.debounce {
                return Admission::Debounced;
            }
        }

        self.last_admitted.insert(key.clone(), now);
        self.queued_keys.insert(key);
        self.queue.push_back(unit.clone());
        Admission::Queued(unit)
    }

    /// Pop the next unit unless a scan is already running
    pub fn start_next(&mut self) -> Option<PathBuf> {
        if self.in_flight.is_some() {
            return None;
        }
        let unit = self.queue.pop_front()?;
        let key = unit_key(&unit);
        self.queued_keys.remove(&key);
        self.in_flight = Some(key);
        Some(unit)
    }

    pub fn finish(&mut self) {
        self.in_flight = None;
    }

    pub fn is_scanning(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Last-seen unit mtimes for the periodic sweep
#[derive(Debug, Default)]
pub struct SweepState {
    last_seen: HashMap<String, SystemTime>,
}

impl SweepState {
    /// Units whose mtime advanced since the last sweep. First-seen units are
    /// returned only when `include_new` is set; otherwise they only record
    /// a baseline.
    pub fn sweep(&mut self, roots: &[PathBuf], depth: usize, include_new: bool) -> Vec<PathBuf> {
        let depth = depth.clamp(SWEEP_DEPTH_RANGE.0, SWEEP_DEPTH_RANGE.1);
        let mut changed = Vec::new();

        for root in roots {
            for unit in discover_units(root, depth, true) {
                let Ok(mtime) = std::fs::metadata(&unit).and_then(|m| m.modified()) else {
                    continue;
                };
                match self.last_seen.insert(unit_key(&unit), mtime) {
                    Some(previous) if mtime > previous => changed.push(unit),
                    Some(_) => {}
                    None if include_new => changed.push(unit),
                    None => {}
                }
            }
        }
        changed
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub roots: Vec<PathBuf>,
    pub recurse_depth: usize,
    /// Treat pre-existing content as new
    pub include_existing: bool,
    /// `None` disables the periodic sweep
    pub rescan_interval: Option<Duration>,
    pub debounce: Duration,
}

/// Start the scheduler loop; it consumes `triggers` until cancelled
pub fn spawn_scheduler(
    scanner: Arc<dyn UnitScan>,
    options: SchedulerOptions,
    events: EventBus,
    triggers: mpsc::Receiver<PathBuf>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_scheduler(scanner, options, events, triggers, cancel))
}

type ScanJob = JoinHandle<PathBuf>;

async fn run_scheduler(
    scanner: Arc<dyn UnitScan>,
    options: SchedulerOptions,
    events: EventBus,
    mut triggers: mpsc::Receiver<PathBuf>,
    cancel: CancellationToken,
) {
    let mut queue = ScanQueue::new(options.debounce);
    let mut sweep_state = SweepState::default();
    let mut current: Option<ScanJob> = None;
    let mut triggers_open = true;

    if !options.include_existing {
        sweep_state = run_sweep(sweep_state, &options).await.0;
        tracing::debug!(units = sweep_state.tracked(), "Sweep baseline recorded");
    }

    let mut sweep_timer: Option<Interval> = options.rescan_interval.map(|period| {
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer
    });

    tracing::info!(
        roots = options.roots.len(),
        sweep_secs = options.rescan_interval.map(|d| d.as_secs()),
        "Scan scheduler started"
    );

    loop {
        if current.is_none() {
            if let Some(unit) = queue.start_next() {
                current = Some(start_scan(scanner.clone(), unit));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,

            trigger = triggers.recv(), if triggers_open => match trigger {
                Some(path) => admit(&mut queue, &events, &path),
                None => triggers_open = false,
            },

            finished = wait_for(&mut current) => {
                current = None;
                queue.finish();
                if let Err(e) = finished {
                    tracing::error!(error = %e, "Scan task panicked");
                }
            }

            _ = tick(&mut sweep_timer) => {
                let (state, changed) = run_sweep(sweep_state, &options).await;
                sweep_state = state;
                if !changed.is_empty() {
                    tracing::info!(units = changed.len(), "Periodic sweep found changed units");
                }
                for unit in changed {
                    admit(&mut queue, &events, &unit);
                }
            }
        }
    }

    if let Some(job) = current {
        job.abort();
    }
    tracing::info!(queued = queue.len(), "Scan scheduler stopped");
}

fn admit(queue: &mut ScanQueue, events: &EventBus, trigger: &Path) {
    match queue.admit(trigger, Instant::now()) {
        Admission::Queued(unit) => {
            tracing::info!(unit = %unit.display(), waiting = queue.len(), "Unit queued for scan");
            events.emit_lossy(AgentEvent::UnitQueued {
                unit_path: unit.display().to_string(),
                timestamp: Utc::now(),
            });
        }
        Admission::Invalid => {
            tracing::debug!(path = %trigger.display(), "Trigger is not a unit, ignored");
        }
        other => {
            tracing::debug!(path = %trigger.display(), admission = ?other, "Trigger dropped");
        }
    }
}

fn start_scan(scanner: Arc<dyn UnitScan>, unit: PathBuf) -> ScanJob {
    tokio::spawn(async move {
        tracing::debug!(unit = %unit.display(), "Scan started");
        if let Err(e) = scanner.scan_unit(&unit).await {
            tracing::warn!(unit = %unit.display(), error = %e, "Scan failed");
        }
        unit
    })
}

async fn wait_for(job: &mut Option<ScanJob>) -> Result<PathBuf, tokio::task::JoinError> {
    match job {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_sweep(mut state: SweepState, options: &SchedulerOptions) -> (SweepState, Vec<PathBuf>) {
    let roots = options.roots.clone();
    let depth = options.recurse_depth;
    let include_new = options.include_existing;

    match tokio::task::spawn_blocking(move || {
        let changed = state.sweep(&roots, depth, include_new);
        (state, changed)
    })
    .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Sweep task failed");
            (SweepState::default(), Vec::new())
        }
    }
}
