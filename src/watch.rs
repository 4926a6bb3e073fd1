//! File-change notification.
//!
//! `FsChangeNotifier` watches individual rule-set files and reports each
//! changed path to a callback (the cache turns that into `mark_stale`).
//! `SourceWatcher` watches project roots and turns filesystem events into
//! incremental build deltas for continuous mode.

use crate::cache::RuleSetCache;
use crate::error::{PipelineError, PipelineResult};
use crate::location::normalize_path;
use crate::orchestrator::{ChangeKind, FileChange};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(300);

/// Path-level change registration used by the rule-set cache.
pub trait ChangeNotifier: Send + Sync {
    fn watch(&self, path: &Path) -> PipelineResult<()>;
    fn unwatch(&self, path: &Path);
}

/// Watches files through their parent directories so that editors which
/// save by rename still produce events.
pub struct FsChangeNotifier {
    debouncer: Mutex<Debouncer<RecommendedWatcher>>,
    files: Arc<Mutex<HashSet<PathBuf>>>,
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

impl FsChangeNotifier {
    pub fn new(on_change: impl Fn(&Path) + Send + Sync + 'static) -> notify::Result<Self> {
        let files: Arc<Mutex<HashSet<PathBuf>>> = Arc::default();
        let watched = files.clone();

        let debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| match result {
            Ok(events) => {
                let changed: HashSet<PathBuf> = events
                    .into_iter()
                    .map(|e| normalize_path(&e.path))
                    .filter(|p| watched.lock().contains(p))
                    .collect();
                for path in changed {
                    on_change(&path);
                }
            }
            Err(err) => tracing::warn!("rule-set watcher error: {err}"),
        })?;

        Ok(Self {
            debouncer: Mutex::new(debouncer),
            files,
            dirs: Mutex::new(HashMap::new()),
        })
    }

    /// Create a notifier that marks `cache` entries stale and register it
    /// with the cache.
    pub fn attach(cache: &Arc<RuleSetCache>) -> notify::Result<Arc<Self>> {
        let weak = Arc::downgrade(cache);
        let notifier = Arc::new(Self::new(move |path| {
            if let Some(cache) = weak.upgrade() {
                cache.mark_stale(path);
            }
        })?);
        cache.set_notifier(notifier.clone());
        Ok(notifier)
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.files.lock().iter().cloned().collect();
        files.sort();
        files
    }
}

impl ChangeNotifier for FsChangeNotifier {
    fn watch(&self, path: &Path) -> PipelineResult<()> {
        let path = normalize_path(path);
        if !self.files.lock().insert(path.clone()) {
            return Ok(());
        }

        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let mut dirs = self.dirs.lock();
        let count = dirs.entry(dir.clone()).or_insert(0);
        if *count == 0 {
            self.debouncer
                .lock()
                .watcher()
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| {
                    self.files.lock().remove(&path);
                    PipelineError::other(format!("cannot watch {}: {e}", dir.display()))
                })?;
        }
        *count += 1;
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        let path = normalize_path(path);
        if !self.files.lock().remove(&path) {
            return;
        }

        let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let mut dirs = self.dirs.lock();
        if let Some(count) = dirs.get_mut(&dir) {
            *count -= 1;
            if *count == 0 {
                dirs.remove(&dir);
                if let Err(err) = self.debouncer.lock().watcher().unwatch(&dir) {
                    tracing::debug!(dir = %dir.display(), "unwatch failed: {err}");
                }
            }
        }
    }
}

/// Watches project roots and reports source changes as build deltas.
pub struct SourceWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    receiver: Receiver<DebounceEventResult>,
    extensions: Vec<String>,
    known: HashSet<PathBuf>,
}

impl SourceWatcher {
    pub fn new(
        roots: &[PathBuf],
        extensions: &[String],
        known: impl IntoIterator<Item = PathBuf>,
    ) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut debouncer = new_debouncer(DEBOUNCE, tx)?;
        for root in roots {
            debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
        }

        Ok(Self {
            _debouncer: debouncer,
            receiver: rx,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            known: known.into_iter().map(|p| normalize_path(&p)).collect(),
        })
    }

    /// Wait up to `timeout` for the next batch of source changes.
    ///
    /// Returns `None` on timeout, on a watcher error, or when the batch had
    /// no relevant paths.
    pub fn next_changes(&mut self, timeout: Duration) -> Option<Vec<FileChange>> {
        let events = match self.receiver.recv_timeout(timeout) {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                tracing::warn!("source watcher error: {err}");
                return None;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        };

        let mut seen = HashSet::new();
        let mut changes = Vec::new();
        for event in events {
            let path = normalize_path(&event.path);
            if !has_extension(&path, &self.extensions) || !seen.insert(path.clone()) {
                continue;
            }
            let kind = classify(path.is_file(), self.known.contains(&path));
            let Some(kind) = kind else {
                continue;
            };
            match kind {
                ChangeKind::Added => {
                    self.known.insert(path.clone());
                }
                ChangeKind::Removed => {
                    self.known.remove(&path);
                }
                ChangeKind::Changed => {}
            }
            changes.push(FileChange { path, kind });
        }

        (!changes.is_empty()).then_some(changes)
    }
}

pub(crate) fn has_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
}

fn classify(exists: bool, known: bool) -> Option<ChangeKind> {
    match (exists, known) {
        (true, true) => Some(ChangeKind::Changed),
        (true, false) => Some(ChangeKind::Added),
        (false, true) => Some(ChangeKind::Removed),
        (false, false) => None,
    }
}
