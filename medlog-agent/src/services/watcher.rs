//! Filesystem watcher
//!
//! Bridges `notify` events into tokio and reduces them to unit paths for the
//! scan scheduler. The notify callback only forwards raw events; all
//! classification and coalescing happens in the async loop.
//!
//! Triggers:
//! - a directory is created (or moved in)
//! - an archive is created, renamed into place or modified
//! - a payload file is created below a device-id directory (searched upward
//!   at most `clamp(depth + 1, 1, 5)` levels)
//!
//! Each unit path gets a trailing-edge debounce: a burst of events for the
//! same unit produces one trigger once the burst has been quiet for the
//! coalesce window. Payload-file triggers are suppressed during the cold
//! start (until initial discovery finishes, or for one second when existing
//! content is ignored).

use crate::services::key_extractor::device_id_in_segment;
use crate::services::units::{discover_units, is_archive_path, normalize_unit_path, unit_key};
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Quiet period before a unit trigger is forwarded
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(3);

/// Payload suppression when existing content is ignored
pub const DEFAULT_COLD_START: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// A qualifying filesystem change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Directory(PathBuf),
    Archive(PathBuf),
    /// Device-id directory above a new payload file
    Payload(PathBuf),
}

impl Trigger {
    pub fn path(&self) -> &Path {
        match self {
            Trigger::Directory(p) | Trigger::Archive(p) | Trigger::Payload(p) => p,
        }
    }
}

/// Which events matter
#[derive(Debug, Clone)]
pub struct WatchFilter {
    pub roots: Vec<PathBuf>,
    /// Lowercase, dot-prefixed
    pub extensions: Vec<String>,
    pub recurse_depth: usize,
}

impl WatchFilter {
    /// Components below the watch root, `None` outside every root
    fn depth_below_root(&self, path: &Path) -> Option<usize> {
        self.roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .map(|rel| rel.components().count())
            .min()
    }

    fn is_payload(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Nearest ancestor directory whose name carries a device id
    fn device_ancestor(&self, file: &Path) -> Option<PathBuf> {
        let levels = (self.recurse_depth + 1).clamp(1, 5);
        let mut current = file.parent();
        for _ in 0..levels {
            let dir = current?;
            if self.roots.iter().any(|root| root.starts_with(dir) && root != dir) {
                return None;
            }
            let named = dir
                .file_name()
                .map(|n| device_id_in_segment(&n.to_string_lossy()).is_some())
                .unwrap_or(false);
            if named {
                return Some(dir.to_path_buf());
            }
            current = dir.parent();
        }
        None
    }

    /// Reduce one notify event to triggers. `is_dir` reports whether a path
    /// currently is a directory.
    pub fn classify<F>(&self, event: &Event, is_dir: F) -> Vec<Trigger>
    where
        F: Fn(&Path) -> bool,
    {
        let paths: Vec<&PathBuf> = match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                event.paths.iter().collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.iter().collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.last().into_iter().collect(),
            _ => return Vec::new(),
        };
        let created = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        );

        let mut triggers = Vec::new();
        for path in paths {
            match self.depth_below_root(path) {
                Some(depth) if depth <= self.recurse_depth + 1 => {}
                _ => continue,
            }

            let dir_event = matches!(event.kind, EventKind::Create(CreateKind::Folder))
                || (created && is_dir(path));
            if dir_event {
                triggers.push(Trigger::Directory(path.clone()));
            } else if is_archive_path(path) {
                triggers.push(Trigger::Archive(path.clone()));
            } else if created && self.is_payload(path) {
                if let Some(unit) = self.device_ancestor(path) {
                    triggers.push(Trigger::Payload(unit));
                }
            }
        }
        triggers
    }
}

/// Trailing-edge debounce keyed by lowercase unit path
#[derive(Debug)]
pub struct TriggerCoalescer {
    window: Duration,
    pending: HashMap<String, (PathBuf, Instant)>,
}

impl TriggerCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record a trigger; a repeat pushes the deadline out again
    pub fn push(&mut self, unit: PathBuf, now: Instant) {
        let deadline = now + self.window;
        self.pending.insert(unit_key(&unit), (unit, deadline));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, deadline)| *deadline).min()
    }

    /// Units whose window has elapsed, in path order
    pub fn drain_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let mut units: Vec<PathBuf> = due
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|(unit, _)| unit))
            .collect();
        units.sort();
        units
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub filter: WatchFilter,
    pub include_existing: bool,
    pub coalesce_window: Duration,
    pub cold_start: Duration,
}

/// Running watcher; dropping it stops the OS watch
pub struct UnitWatcher {
    watcher: RecommendedWatcher,
    join: JoinHandle<()>,
}

impl UnitWatcher {
    /// Stop the OS watch and wait for the event loop to drain
    pub async fn stop(self) {
        drop(self.watcher);
        if let Err(e) = self.join.await {
            if !e.is_cancelled() {
                tracing::warn!(error = %e, "Watcher event loop ended abnormally");
            }
        }
    }
}

/// Start watching the configured roots. Unit paths are sent on `triggers`.
pub fn start_watcher(
    options: WatcherOptions,
    triggers: mpsc::Sender<PathBuf>,
    cancel: CancellationToken,
) -> Result<UnitWatcher, WatcherError> {
    let (event_tx, event_rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if event_tx.blocking_send(event).is_err() {
                tracing::debug!("Watcher event loop gone, event dropped");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Filesystem watcher error"),
    })?;

    for root in &options.filter.roots {
        if !root.is_dir() {
            tracing::warn!(root = %root.display(), "Watch path is not a directory, skipped");
            continue;
        }
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => tracing::info!(root = %root.display(), "Watching"),
            Err(e) => tracing::warn!(root = %root.display(), error = %e, "Could not watch path"),
        }
    }

    let suppress_payloads = Arc::new(AtomicBool::new(true));
    start_cold_start(&options, triggers.clone(), suppress_payloads.clone(), cancel.clone());

    let join = tokio::spawn(run_event_loop(
        options,
        event_rx,
        triggers,
        suppress_payloads,
        cancel,
    ));
    Ok(UnitWatcher { watcher, join })
}

/// Initial discovery (include-existing mode) or a fixed quiet period, then
/// payload triggers are let through.
fn start_cold_start(
    options: &WatcherOptions,
    triggers: mpsc::Sender<PathBuf>,
    suppress_payloads: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    if !options.include_existing {
        let cold_start = options.cold_start;
        tokio::spawn(async move {
            tokio::time::sleep(cold_start).await;
            suppress_payloads.store(false, Ordering::Release);
        });
        return;
    }

    let roots = options.filter.roots.clone();
    let depth = options.filter.recurse_depth;
    tokio::spawn(async move {
        let units = tokio::task::spawn_blocking(move || {
            roots
                .iter()
                .flat_map(|root| discover_units(root, depth, false))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Initial discovery failed");
            Vec::new()
        });

        tracing::info!(units = units.len(), "Initial discovery finished");
        for unit in units {
            if cancel.is_cancelled() || triggers.send(unit).await.is_err() {
                break;
            }
        }
        suppress_payloads.store(false, Ordering::Release);
    });
}

async fn run_event_loop(
    options: WatcherOptions,
    mut events: mpsc::Receiver<Event>,
    triggers: mpsc::Sender<PathBuf>,
    suppress_payloads: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut coalescer = TriggerCoalescer::new(options.coalesce_window);

    loop {
        let deadline = coalescer.next_deadline();
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                let now = Instant::now();
                for trigger in options.filter.classify(&event, |p| p.is_dir()) {
                    if matches!(trigger, Trigger::Payload(_)) && suppress_payloads.load(Ordering::Acquire) {
                        tracing::trace!(path = %trigger.path().display(), "Payload trigger suppressed during cold start");
                        continue;
                    }
                    for unit in units_for_trigger(trigger, options.filter.recurse_depth).await {
                        coalescer.push(unit, now);
                    }
                }
            }

            _ = sleep_until(deadline) => {
                for unit in coalescer.drain_due(Instant::now()) {
                    tracing::debug!(unit = %unit.display(), "Filesystem change detected");
                    if triggers.send(unit).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    tracing::debug!(pending = coalescer.len(), "Watcher event loop stopped");
}

/// A new directory without a device id may hold whole units (moved in)
async fn units_for_trigger(trigger: Trigger, depth: usize) -> Vec<PathBuf> {
    match trigger {
        Trigger::Directory(dir) if normalize_unit_path(&dir).is_none() => {
            tokio::task::spawn_blocking(move || discover_units(&dir, depth, false))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Unit discovery for new directory failed");
                    Vec::new()
                })
        }
        other => vec![other.path().to_path_buf()],
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::DataChange;
    use std::fs;
    use tempfile::TempDir;

    fn filter(root: &str) -> WatchFilter {
        WatchFilter {
            roots: vec![PathBuf::from(root)],
            extensions: vec![".medbot".to_string()],
            recurse_depth: 2,
        }
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_directory_and_archive_creation() {
        let f = filter("/w");
        assert_eq!(
            f.classify(&event(EventKind::Create(CreateKind::Folder), &["/w/4371-04"]), |_| true),
            vec![Trigger::Directory(PathBuf::from("/w/4371-04"))]
        );
        assert_eq!(
            f.classify(&event(EventKind::Create(CreateKind::File), &["/w/4371-04.zip"]), |_| false),
            vec![Trigger::Archive(PathBuf::from("/w/4371-04.zip"))]
        );
        assert_eq!(
            f.classify(
                &event(
                    EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                    &["/w/a/4371-04.7z"]
                ),
                |_| false
            ),
            vec![Trigger::Archive(PathBuf::from("/w/a/4371-04.7z"))]
        );
    }

    #[test]
    fn test_rename_into_place_uses_target() {
        let f = filter("/w");
        let renamed = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/4371-04.zip.part", "/w/4371-04.zip"],
        );
        assert_eq!(
            f.classify(&renamed, |_| false),
            vec![Trigger::Archive(PathBuf::from("/w/4371-04.zip"))]
        );
    }

    #[test]
    fn test_payload_file_maps_to_device_directory() {
        let f = filter("/w");
        let created = event(EventKind::Create(CreateKind::File), &["/w/4371-04/day/1700000000_log.medbot"]);
        assert_eq!(
            f.classify(&created, |_| false),
            vec![Trigger::Payload(PathBuf::from("/w/4371-04"))]
        );

        let orphan = event(EventKind::Create(CreateKind::File), &["/w/misc/1700000000_log.medbot"]);
        assert!(f.classify(&orphan, |_| false).is_empty());

        let modified = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/w/4371-04/1700000000_log.medbot"],
        );
        assert!(f.classify(&modified, |_| false).is_empty());
    }

    #[test]
    fn test_events_too_deep_or_outside_roots_are_ignored() {
        let f = filter("/w");
        let deep = event(EventKind::Create(CreateKind::Folder), &["/w/a/b/c/d"]);
        assert!(f.classify(&deep, |_| true).is_empty());
        let outside = event(EventKind::Create(CreateKind::Folder), &["/elsewhere/4371-04"]);
        assert!(f.classify(&outside, |_| true).is_empty());
        let removed = event(EventKind::Remove(notify::event::RemoveKind::Folder), &["/w/4371-04"]);
        assert!(f.classify(&removed, |_| true).is_empty());
    }

    #[test]
    fn test_coalescer_trailing_edge() {
        let mut c = TriggerCoalescer::new(Duration::from_secs(3));
        let t0 = Instant::now();
        c.push(PathBuf::from("/w/4371-04"), t0);
        c.push(PathBuf::from("/W/4371-04"), t0 + Duration::from_secs(2));
        assert_eq!(c.len(), 1);

        assert!(c.drain_due(t0 + Duration::from_secs(4)).is_empty());
        assert_eq!(c.next_deadline(), Some(t0 + Duration::from_secs(5)));
        assert_eq!(c.drain_due(t0 + Duration::from_secs(5)).len(), 1);
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_reports_new_unit_directory() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let options = WatcherOptions {
            filter: WatchFilter {
                roots: vec![root.clone()],
                extensions: vec![".medbot".to_string()],
                recurse_depth: 4,
            },
            include_existing: false,
            coalesce_window: Duration::from_millis(100),
            cold_start: Duration::from_millis(10),
        };
        let _watcher = start_watcher(options, tx, cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::create_dir_all(root.join("4371-04")).unwrap();

        let unit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unit, root.join("4371-04"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_initial_discovery_in_include_existing_mode() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("site/4371-04")).unwrap();
        fs::write(root.join("4380-11.zip"), b"zip").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let options = WatcherOptions {
            filter: WatchFilter {
                roots: vec![root.clone()],
                extensions: vec![".medbot".to_string()],
                recurse_depth: 4,
            },
            include_existing: true,
            coalesce_window: Duration::from_millis(100),
            cold_start: Duration::from_millis(10),
        };
        let _watcher = start_watcher(options, tx, CancellationToken::new()).unwrap();

        let mut found = Vec::new();
        for _ in 0..2 {
            found.push(
                tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        found.sort();
        assert_eq!(found, vec![root.join("4380-11.zip"), root.join("site/4371-04")]);
    }

    #[tokio::test]
    async fn test_cold_start_suppresses_payload_triggers_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir_all(root.join("4371-04")).unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let options = WatcherOptions {
            filter: WatchFilter {
                roots: vec![root.clone()],
                extensions: vec![".medbot".to_string()],
                recurse_depth: 4,
            },
            include_existing: false,
            coalesce_window: Duration::from_millis(100),
            cold_start: Duration::from_secs(60),
        };
        let _watcher = start_watcher(options, tx, cancel.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(root.join("4371-04/1700000000_log.medbot"), b"payload").unwrap();
        fs::write(root.join("4380-11.zip"), b"zip").unwrap();
        fs::create_dir_all(root.join("4390-22")).unwrap();

        let mut found = Vec::new();
        for _ in 0..2 {
            found.push(
                tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        found.sort();
        assert_eq!(found, vec![root.join("4380-11.zip"), root.join("4390-22")]);

        let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(extra.is_err(), "payload trigger leaked: {:?}", extra);
        cancel.cancel();
    }
}
