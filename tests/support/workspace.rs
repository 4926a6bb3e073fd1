#![allow(dead_code)]

use move_clippy_incremental::diagnostics::{DiagnosticSink, MemorySink};
use move_clippy_incremental::location::{
    FetchContext, RuleSetConfiguration, RuleSetLocation, normalize_path,
};
use move_clippy_incremental::orchestrator::{BuildOrchestrator, ProjectId, ProjectSettings};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub const BASICS: &str = include_str!("../fixtures/rules/basics.toml");
pub const STRICT: &str = include_str!("../fixtures/rules/strict.toml");
pub const VIOLATIONS: &str = include_str!("../fixtures/sources/violations.move");
pub const CLEAN: &str = include_str!("../fixtures/sources/clean.move");

/// A workspace on disk with one project rooted at `project/`.
pub struct TempWorkspace {
    dir: TempDir,
    root: PathBuf,
}

impl TempWorkspace {
    pub fn new(sources: &[(&str, &str)]) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = normalize_path(dir.path());
        fs::create_dir_all(root.join("rules"))?;
        fs::write(root.join("rules/basics.toml"), BASICS)?;
        fs::write(root.join("rules/strict.toml"), STRICT)?;

        let ws = Self { dir, root };
        for (rel, contents) in sources {
            ws.write(rel, contents)?;
        }
        Ok(ws)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_root(&self) -> PathBuf {
        self.root.join("project")
    }

    /// Path of a project-relative file.
    pub fn file(&self, rel: &str) -> PathBuf {
        self.project_root().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.file(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn remove(&self, rel: &str) -> std::io::Result<PathBuf> {
        let path = self.file(rel);
        fs::remove_file(&path)?;
        Ok(path)
    }

    pub fn rule_set(&self, id: u32, name: &str) -> RuleSetConfiguration {
        RuleSetConfiguration::new(
            id,
            name,
            RuleSetLocation::WorkspaceRelativePath(PathBuf::from(format!("rules/{name}.toml"))),
        )
    }

    pub fn settings(&self, rule_sets: &[&str]) -> ProjectSettings {
        let configurations = rule_sets
            .iter()
            .enumerate()
            .map(|(i, name)| self.rule_set(i as u32, name))
            .collect();
        ProjectSettings::new("project", self.project_root()).with_configurations(configurations)
    }

    pub fn fetch_context(&self) -> FetchContext {
        FetchContext::new(&self.root)
    }

    /// Orchestrator over the default analyzer, posting into a memory sink.
    pub fn orchestrator(&self, settings: ProjectSettings) -> (Arc<MemorySink>, BuildOrchestrator) {
        let sink = Arc::new(MemorySink::new());
        let analyzer = move_clippy_incremental::create_default_analyzer(
            self.fetch_context(),
            sink.clone() as Arc<dyn DiagnosticSink>,
        );
        let orchestrator =
            BuildOrchestrator::with_threads(analyzer, vec![settings], 2).expect("worker pool");
        (sink, orchestrator)
    }
}

pub fn project() -> ProjectId {
    ProjectId::from("project")
}

pub fn rule_ids(sink: &MemorySink, file: &Path) -> Vec<String> {
    sink.diagnostics(file)
        .into_iter()
        .map(|d| d.rule_id)
        .collect()
}
