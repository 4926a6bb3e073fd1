//! Rule-set configurations and where their content lives.
//!
//! A [`RuleSetConfiguration`] is immutable. Each location kind knows how to
//! produce a local, readable byte source for its content; network locations
//! are downloaded into a fresh temporary file on every fetch.

use crate::error::{PipelineError, PipelineResult};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use url::Url;

/// Where a rule set's definitions are stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleSetLocation {
    FileSystemPath(PathBuf),
    NetworkUri(String),
    /// Relative to the workspace root held by the [`FetchContext`].
    WorkspaceRelativePath(PathBuf),
}

impl fmt::Display for RuleSetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSetLocation::FileSystemPath(p) => write!(f, "{}", p.display()),
            RuleSetLocation::NetworkUri(u) => f.write_str(u),
            RuleSetLocation::WorkspaceRelativePath(p) => write!(f, "workspace:{}", p.display()),
        }
    }
}

/// Canonical identity of a location, used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocationKey {
    Path(PathBuf),
    Uri(String),
}

impl LocationKey {
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            LocationKey::Path(p) => Some(p),
            LocationKey::Uri(_) => None,
        }
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationKey::Path(p) => write!(f, "{}", p.display()),
            LocationKey::Uri(u) => f.write_str(u),
        }
    }
}

/// Environment needed to turn a location into bytes.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub workspace_root: PathBuf,
    pub http_timeout: Duration,
}

impl FetchContext {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self::new(".")
    }
}

/// A local, readable copy of a rule set's content.
///
/// Downloaded content lives in a temporary file that is removed when this
/// value is dropped, whatever happens to the cache entry built from it.
#[derive(Debug)]
pub enum FetchedSource {
    Local(PathBuf),
    Downloaded(NamedTempFile),
}

impl FetchedSource {
    pub fn path(&self) -> &Path {
        match self {
            FetchedSource::Local(p) => p,
            FetchedSource::Downloaded(tmp) => tmp.path(),
        }
    }

    /// Open a fresh reader over the content.
    pub fn open(&self) -> io::Result<File> {
        match self {
            FetchedSource::Local(p) => File::open(p),
            FetchedSource::Downloaded(tmp) => tmp.reopen(),
        }
    }
}

impl RuleSetLocation {
    /// Resolve a workspace-relative location against the workspace root.
    pub fn local_path(&self, ctx: &FetchContext) -> Option<PathBuf> {
        match self {
            RuleSetLocation::FileSystemPath(p) => Some(p.clone()),
            RuleSetLocation::WorkspaceRelativePath(p) => Some(ctx.workspace_root.join(p)),
            RuleSetLocation::NetworkUri(_) => None,
        }
    }

    /// Compute the canonical identity of this location.
    ///
    /// Paths are canonicalized when they exist and lexically normalized
    /// otherwise; URIs are parsed (lowercasing scheme and host, dropping
    /// default ports) and stripped of their fragment.
    pub fn key(&self, ctx: &FetchContext) -> LocationKey {
        match self {
            RuleSetLocation::NetworkUri(raw) => LocationKey::Uri(normalize_uri(raw)),
            _ => {
                let path = self.local_path(ctx).unwrap_or_default();
                LocationKey::Path(normalize_path(&path))
            }
        }
    }

    /// Produce a local byte source for the content.
    pub fn fetch(&self, ctx: &FetchContext) -> PipelineResult<FetchedSource> {
        match self {
            RuleSetLocation::FileSystemPath(_) | RuleSetLocation::WorkspaceRelativePath(_) => {
                let path = self.local_path(ctx).unwrap_or_default();
                if !path.is_file() {
                    return Err(PipelineError::unreachable(self, "file does not exist"));
                }
                Ok(FetchedSource::Local(path))
            }
            RuleSetLocation::NetworkUri(uri) => download(uri, ctx).map(FetchedSource::Downloaded),
        }
    }
}

fn download(uri: &str, ctx: &FetchContext) -> PipelineResult<NamedTempFile> {
    let agent = ureq::AgentBuilder::new().timeout(ctx.http_timeout).build();
    let response = agent
        .get(uri)
        .call()
        .map_err(|e| PipelineError::unreachable(uri, e))?;

    if response.status() != 200 {
        return Err(PipelineError::unreachable(
            uri,
            format!("HTTP {}", response.status()),
        ));
    }

    let mut tmp = tempfile::Builder::new()
        .prefix("ruleset-")
        .suffix(".toml")
        .tempfile()
        .map_err(|e| PipelineError::unreachable(uri, e))?;
    let mut reader = response.into_reader();
    io::copy(&mut reader, tmp.as_file_mut()).map_err(|e| PipelineError::unreachable(uri, e))?;
    Ok(tmp)
}

pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Deleted files: canonicalize the parent so the key still matches.
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && let Ok(parent) = parent.canonicalize()
    {
        return parent.join(name);
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub fn normalize_uri(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// A named, identified rule-set configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSetConfiguration {
    pub id: u32,
    pub name: String,
    pub location: RuleSetLocation,
}

impl RuleSetConfiguration {
    pub fn new(id: u32, name: impl Into<String>, location: RuleSetLocation) -> Self {
        Self {
            id,
            name: name.into(),
            location,
        }
    }

    /// Copy pointing at `location`; configurations are never mutated.
    #[must_use]
    pub fn with_location(&self, location: RuleSetLocation) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            location,
        }
    }

    pub fn fetch(&self, ctx: &FetchContext) -> PipelineResult<FetchedSource> {
        self.location.fetch(ctx)
    }

    /// Read the full content, mainly for tooling that bypasses the cache.
    pub fn read_to_bytes(&self, ctx: &FetchContext) -> PipelineResult<Vec<u8>> {
        let fetched = self.fetch(ctx)?;
        let mut bytes = Vec::new();
        fetched
            .open()
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|e| PipelineError::unreachable(&self.location, e))?;
        Ok(bytes)
    }
}
