//! Build orchestration: which projects are enabled, which files to analyze
//! after a build, and where the work runs.

use crate::analyzer::{
    AnalysisOutcome, AnalysisReport, AnalysisRequest, Analyzer, CancellationToken,
    ConfigurationWarning,
};
use crate::config::WorkspaceConfig;
use crate::diagnostics::DiagnosticSink;
use crate::error::{PipelineError, PipelineResult};
use crate::location::{RuleSetConfiguration, normalize_path};
use crate::watch::has_extension;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProjectId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Disabled,
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Full,
    Incremental,
}

/// What the host build system reports after a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDelta {
    pub kind: BuildKind,
    pub changes: Vec<FileChange>,
}

impl BuildDelta {
    pub fn full() -> Self {
        Self {
            kind: BuildKind::Full,
            changes: Vec::new(),
        }
    }

    pub fn incremental(changes: Vec<FileChange>) -> Self {
        Self {
            kind: BuildKind::Incremental,
            changes,
        }
    }
}

/// Totals for one build cycle of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub analyzed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub removed: usize,
    pub posted: usize,
    pub retracted: usize,
    pub skipped: usize,
    /// Unique configuration failures seen during the cycle.
    pub warnings: Vec<ConfigurationWarning>,
}

/// Resolved settings for one project.
#[derive(Debug, Clone)]
pub struct ProjectSettings {
    pub id: ProjectId,
    pub root: PathBuf,
    pub configurations: Arc<[RuleSetConfiguration]>,
    pub extensions: Vec<String>,
    pub min_priority: u8,
    /// Whether the project starts enabled.
    pub enabled: bool,
}

impl ProjectSettings {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: ProjectId::new(id),
            root: root.into(),
            configurations: Arc::from(Vec::new()),
            extensions: vec!["move".to_string()],
            min_priority: crate::level::LOWEST_PRIORITY,
            enabled: true,
        }
    }

    pub fn with_configurations(mut self, configurations: Vec<RuleSetConfiguration>) -> Self {
        self.configurations = configurations.into();
        self
    }

    fn is_eligible(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
            && has_extension(path, &self.extensions)
            && !path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .components()
                .any(|c| is_skipped_dir(&c.as_os_str().to_string_lossy()))
    }
}

fn is_skipped_dir(name: &str) -> bool {
    (name.starts_with('.') && name != "." && name != "..") || name == "build" || name == "target"
}

/// Every eligible source file under the project root, sorted.
fn eligible_files(settings: &ProjectSettings) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(&settings.root)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!("skipping unreadable entry: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| normalize_path(entry.path()))
        .filter(|path| has_extension(path, &settings.extensions))
        .collect();
    files.sort();
    files
}

struct ProjectState {
    settings: ProjectSettings,
    enabled: bool,
    last_summary: Option<BuildSummary>,
}

struct InFlight {
    project: ProjectId,
    token: CancellationToken,
    generation: u64,
}

/// Counters for one build cycle, finalized when its last task completes.
struct Cycle {
    project: ProjectId,
    remaining: AtomicUsize,
    summary: Mutex<BuildSummary>,
    warnings: Mutex<BTreeSet<ConfigurationWarning>>,
}

impl Cycle {
    fn new(project: ProjectId, tasks: usize, summary: BuildSummary) -> Arc<Self> {
        Arc::new(Self {
            project,
            remaining: AtomicUsize::new(tasks),
            summary: Mutex::new(summary),
            warnings: Mutex::new(BTreeSet::new()),
        })
    }

    fn record(&self, report: AnalysisReport) {
        self.warnings.lock().extend(report.warnings);
        let mut summary = self.summary.lock();
        match report.outcome {
            AnalysisOutcome::Applied(applied) => {
                summary.analyzed += 1;
                summary.posted += applied.posted;
                summary.retracted += applied.retracted;
                summary.skipped += applied.skipped;
            }
            AnalysisOutcome::Cancelled => summary.cancelled += 1,
            AnalysisOutcome::Failed(_) => summary.failed += 1,
        }
    }

    /// Returns the final summary once every task has reported.
    fn complete_one(&self) -> Option<BuildSummary> {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return None;
        }
        Some(self.finish())
    }

    fn finish(&self) -> BuildSummary {
        let mut summary = self.summary.lock().clone();
        summary.warnings = self.warnings.lock().iter().cloned().collect();
        summary
    }
}

struct Shared {
    analyzer: Analyzer,
    projects: Mutex<BTreeMap<ProjectId, ProjectState>>,
    inflight: Mutex<HashMap<PathBuf, InFlight>>,
    pending: Mutex<usize>,
    idle: Condvar,
    generation: AtomicU64,
}

impl Shared {
    fn publish(&self, project: &ProjectId, summary: BuildSummary) {
        for warning in &summary.warnings {
            tracing::warn!(project = %project, "{warning}");
        }
        tracing::info!(
            project = %project,
            analyzed = summary.analyzed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            removed = summary.removed,
            posted = summary.posted,
            retracted = summary.retracted,
            "build cycle finished"
        );
        if let Some(state) = self.projects.lock().get_mut(project) {
            state.last_summary = Some(summary);
        }
    }

    fn finish_task(&self, file: &Path, generation: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.get(file).is_some_and(|f| f.generation == generation) {
            inflight.remove(file);
        }
    }

    fn task_done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    fn cancel_file(&self, file: &Path) {
        if let Some(previous) = self.inflight.lock().remove(file) {
            previous.token.cancel();
        }
    }

    fn cancel_project(&self, project: &ProjectId) {
        let mut inflight = self.inflight.lock();
        inflight.retain(|_, f| {
            if &f.project == project {
                f.token.cancel();
                false
            } else {
                true
            }
        });
    }
}

/// Owns the project registry and dispatches analysis work.
pub struct BuildOrchestrator {
    shared: Arc<Shared>,
    pool: ThreadPool,
}

impl BuildOrchestrator {
    pub fn new(analyzer: Analyzer, projects: Vec<ProjectSettings>) -> PipelineResult<Self> {
        Self::with_threads(analyzer, projects, 0)
    }

    pub fn with_threads(
        analyzer: Analyzer,
        projects: Vec<ProjectSettings>,
        threads: usize,
    ) -> PipelineResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("analysis-{i}"))
            .build()
            .map_err(|e| PipelineError::other(format!("cannot start worker pool: {e}")))?;

        let projects = projects
            .into_iter()
            .map(|settings| {
                (
                    settings.id.clone(),
                    ProjectState {
                        settings,
                        enabled: false,
                        last_summary: None,
                    },
                )
            })
            .collect();

        Ok(Self {
            shared: Arc::new(Shared {
                analyzer,
                projects: Mutex::new(projects),
                inflight: Mutex::new(HashMap::new()),
                pending: Mutex::new(0),
                idle: Condvar::new(),
                generation: AtomicU64::new(0),
            }),
            pool,
        })
    }

    /// Build an orchestrator from a workspace configuration rooted at
    /// `base_dir`, with the Move tree provider and the pattern engine.
    pub fn from_config(
        config: &WorkspaceConfig,
        base_dir: &Path,
        sink: Arc<dyn DiagnosticSink>,
    ) -> anyhow::Result<Self> {
        let analyzer = crate::create_default_analyzer(config.fetch_context(base_dir), sink);
        let projects = config.project_settings(base_dir)?;
        Ok(Self::with_threads(analyzer, projects, config.settings.threads)?)
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.shared.analyzer
    }

    pub fn projects(&self) -> Vec<ProjectId> {
        self.shared.projects.lock().keys().cloned().collect()
    }

    /// Projects whose configuration asks for them to start enabled.
    pub fn initially_enabled(&self) -> Vec<ProjectId> {
        self.shared
            .projects
            .lock()
            .values()
            .filter(|state| state.settings.enabled)
            .map(|state| state.settings.id.clone())
            .collect()
    }

    pub fn settings(&self, project: &ProjectId) -> PipelineResult<ProjectSettings> {
        self.shared
            .projects
            .lock()
            .get(project)
            .map(|state| state.settings.clone())
            .ok_or_else(|| PipelineError::UnknownProject(project.to_string()))
    }

    pub fn status(&self, project: &ProjectId) -> PipelineResult<ProjectStatus> {
        let enabled = self
            .shared
            .projects
            .lock()
            .get(project)
            .map(|state| state.enabled)
            .ok_or_else(|| PipelineError::UnknownProject(project.to_string()))?;
        if !enabled {
            return Ok(ProjectStatus::Disabled);
        }
        let running = self
            .shared
            .inflight
            .lock()
            .values()
            .any(|f| &f.project == project);
        Ok(if running {
            ProjectStatus::Running
        } else {
            ProjectStatus::Idle
        })
    }

    pub fn last_summary(&self, project: &ProjectId) -> Option<BuildSummary> {
        self.shared
            .projects
            .lock()
            .get(project)
            .and_then(|state| state.last_summary.clone())
    }

    /// Install the build hook for `project` and run a full build.
    pub fn enable(&self, project: &ProjectId) -> PipelineResult<()> {
        {
            let mut projects = self.shared.projects.lock();
            let state = projects
                .get_mut(project)
                .ok_or_else(|| PipelineError::UnknownProject(project.to_string()))?;
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
        }
        tracing::info!(project = %project, "project enabled");
        self.on_build(project, BuildDelta::full())
    }

    /// Cancel work for `project`, retract its diagnostics and release rule
    /// sets no enabled project uses.
    pub fn disable(&self, project: &ProjectId) -> PipelineResult<()> {
        let root = {
            let mut projects = self.shared.projects.lock();
            let state = projects
                .get_mut(project)
                .ok_or_else(|| PipelineError::UnknownProject(project.to_string()))?;
            if !state.enabled {
                return Ok(());
            }
            state.enabled = false;
            state.settings.root.clone()
        };

        self.shared.cancel_project(project);
        let cleared = self
            .shared
            .analyzer
            .processor()
            .forget_under(&normalize_path(&root));

        let live: Vec<RuleSetConfiguration> = self
            .shared
            .projects
            .lock()
            .values()
            .filter(|state| state.enabled)
            .flat_map(|state| state.settings.configurations.iter().cloned())
            .collect();
        self.shared.analyzer.cache().retain(&live);

        tracing::info!(project = %project, cleared = cleared.len(), "project disabled");
        Ok(())
    }

    /// React to a finished build of `project`. Ignored while it is disabled.
    pub fn on_build(&self, project: &ProjectId, delta: BuildDelta) -> PipelineResult<()> {
        let settings = {
            let projects = self.shared.projects.lock();
            let state = projects
                .get(project)
                .ok_or_else(|| PipelineError::UnknownProject(project.to_string()))?;
            if !state.enabled {
                tracing::debug!(project = %project, "build ignored for disabled project");
                return Ok(());
            }
            state.settings.clone()
        };
        let settings = ProjectSettings {
            root: normalize_path(&settings.root),
            ..settings
        };

        let mut summary = BuildSummary::default();
        let files = match delta.kind {
            BuildKind::Full => eligible_files(&settings),
            BuildKind::Incremental => {
                let mut files = Vec::new();
                for change in delta.changes {
                    let path = normalize_path(&change.path);
                    if !settings.is_eligible(&path) {
                        continue;
                    }
                    match change.kind {
                        ChangeKind::Removed => {
                            self.shared.cancel_file(&path);
                            self.shared.analyzer.processor().forget(&path);
                            summary.removed += 1;
                        }
                        ChangeKind::Added | ChangeKind::Changed => files.push(path),
                    }
                }
                files.sort();
                files.dedup();
                files
            }
        };

        tracing::debug!(project = %project, files = files.len(), kind = ?delta.kind, "build cycle started");
        let cycle = Cycle::new(project.clone(), files.len(), summary);
        if files.is_empty() {
            self.shared.publish(project, cycle.finish());
            return Ok(());
        }
        for file in files {
            self.schedule(&settings, file, None, cycle.clone());
        }
        Ok(())
    }

    /// Analyze unsaved `contents` of `file` in place of its on-disk text.
    pub fn analyze_buffer(
        &self,
        project: &ProjectId,
        file: &Path,
        contents: impl Into<Arc<str>>,
    ) -> PipelineResult<()> {
        let settings = self.settings(project)?;
        if self.status(project)? == ProjectStatus::Disabled {
            return Ok(());
        }
        let settings = ProjectSettings {
            root: normalize_path(&settings.root),
            ..settings
        };
        let cycle = Cycle::new(project.clone(), 1, BuildSummary::default());
        self.schedule(&settings, normalize_path(file), Some(contents.into()), cycle);
        Ok(())
    }

    fn schedule(
        &self,
        settings: &ProjectSettings,
        file: PathBuf,
        contents: Option<Arc<str>>,
        cycle: Arc<Cycle>,
    ) {
        let token = CancellationToken::new();
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.shared.inflight.lock().insert(
            file.clone(),
            InFlight {
                project: settings.id.clone(),
                token: token.clone(),
                generation,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(file = %file.display(), "superseding queued analysis");
            previous.token.cancel();
        }

        let request = AnalysisRequest {
            file,
            project: settings.id.clone(),
            project_root: settings.root.clone(),
            configurations: settings.configurations.clone(),
            min_priority: settings.min_priority,
            contents,
            token,
            generation,
        };

        *self.shared.pending.lock() += 1;
        let shared = self.shared.clone();
        self.pool.spawn(move || {
            let report = shared.analyzer.run(&request);
            shared.finish_task(&request.file, generation);
            cycle.record(report);
            if let Some(summary) = cycle.complete_one() {
                shared.publish(&cycle.project, summary);
            }
            shared.task_done();
        });
    }

    /// Block until no analysis is queued or running.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Disable every enabled project and wait for outstanding work.
    pub fn shutdown(&self) {
        let enabled: Vec<ProjectId> = self
            .shared
            .projects
            .lock()
            .values()
            .filter(|state| state.enabled)
            .map(|state| state.settings.id.clone())
            .collect();
        for project in enabled {
            if let Err(err) = self.disable(&project) {
                tracing::warn!(project = %project, "disable failed during shutdown: {err}");
            }
        }
        self.wait_idle();
    }
}
