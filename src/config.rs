//! Workspace configuration (`move-clippy-incremental.toml`).
//!
//! ```toml
//! [settings]
//! http_timeout_secs = 10
//!
//! [[project]]
//! name = "core"
//! root = "packages/core"
//! min_priority = 4
//!
//! [[project.ruleset]]
//! path = "rules/basics.toml"
//!
//! [[project.ruleset]]
//! name = "shared"
//! url = "https://example.com/rules/shared.toml"
//! ```
//!
//! Relative `root` and `path` values resolve against the directory holding
//! the configuration file; `workspace` rule sets stay relative to it.

use crate::level::{HIGHEST_PRIORITY, LOWEST_PRIORITY};
use crate::location::{FetchContext, RuleSetConfiguration, RuleSetLocation};
use crate::orchestrator::{ProjectId, ProjectSettings};
use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "move-clippy-incremental.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Worker threads for analysis; 0 lets rayon decide.
    #[serde(default)]
    pub threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_timeout_secs: default_http_timeout_secs(),
            threads: 0,
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_min_priority")]
    pub min_priority: u8,
    #[serde(default, rename = "ruleset")]
    pub rulesets: Vec<RuleSetEntry>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_enabled() -> bool {
    true
}

fn default_extensions() -> Vec<String> {
    vec!["move".to_string()]
}

fn default_min_priority() -> u8 {
    LOWEST_PRIORITY
}

/// One rule-set reference; exactly one of `path`, `url`, `workspace`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSetEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
}

impl RuleSetEntry {
    pub fn location(&self, base_dir: &Path) -> Result<RuleSetLocation> {
        match (&self.path, &self.url, &self.workspace) {
            (Some(path), None, None) => Ok(RuleSetLocation::FileSystemPath(base_dir.join(path))),
            (None, Some(url), None) => Ok(RuleSetLocation::NetworkUri(url.clone())),
            (None, None, Some(rel)) => Ok(RuleSetLocation::WorkspaceRelativePath(rel.clone())),
            (None, None, None) => bail!("rule set needs one of `path`, `url` or `workspace`"),
            _ => bail!("rule set may set only one of `path`, `url` or `workspace`"),
        }
    }

    fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let path = self.path.as_ref().or(self.workspace.as_ref());
        match (path, &self.url) {
            (Some(path), _) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            (None, Some(url)) => url.clone(),
            (None, None) => "<unnamed>".to_string(),
        }
    }
}

impl ProjectConfig {
    pub fn configurations(&self, base_dir: &Path) -> Result<Vec<RuleSetConfiguration>> {
        self.rulesets
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let location = entry.location(base_dir).with_context(|| {
                    format!("project `{}`, rule set #{}", self.name, index + 1)
                })?;
                Ok(RuleSetConfiguration::new(
                    index as u32,
                    entry.display_name(),
                    location,
                ))
            })
            .collect()
    }
}

impl WorkspaceConfig {
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for project in &self.projects {
            ensure!(!project.name.trim().is_empty(), "project with empty name");
            ensure!(
                names.insert(project.name.as_str()),
                "duplicate project `{}`",
                project.name
            );
            ensure!(
                (HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&project.min_priority),
                "project `{}`: min_priority {} is outside {HIGHEST_PRIORITY}..={LOWEST_PRIORITY}",
                project.name,
                project.min_priority
            );
        }
        Ok(())
    }

    /// Fetch context for rule-set locations of a workspace rooted at `base_dir`.
    pub fn fetch_context(&self, base_dir: &Path) -> FetchContext {
        FetchContext {
            workspace_root: base_dir.to_path_buf(),
            http_timeout: Duration::from_secs(self.settings.http_timeout_secs),
        }
    }

    /// Project settings with every relative path resolved against `base_dir`.
    pub fn project_settings(&self, base_dir: &Path) -> Result<Vec<ProjectSettings>> {
        self.validate()?;
        self.projects
            .iter()
            .map(|project| {
                Ok(ProjectSettings {
                    id: ProjectId::new(project.name.clone()),
                    root: base_dir.join(&project.root),
                    configurations: project.configurations(base_dir)?.into(),
                    extensions: project.extensions.clone(),
                    min_priority: project.min_priority,
                    enabled: project.enabled,
                })
            })
            .collect()
    }
}

pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut cur = Some(start_dir);
    while let Some(dir) = cur {
        let candidate = dir.join(DEFAULT_CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        cur = dir.parent();
    }
    None
}

pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg: WorkspaceConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_config(
    explicit_path: Option<&Path>,
    start_dir: &Path,
) -> Result<Option<(PathBuf, WorkspaceConfig)>> {
    if let Some(p) = explicit_path {
        let cfg = load_config_file(p)?;
        return Ok(Some((p.to_path_buf(), cfg)));
    }

    let Some(p) = find_config_file(start_dir) else {
        return Ok(None);
    };
    let cfg = load_config_file(&p)?;
    Ok(Some((p, cfg)))
}
