use crate::level::Severity;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One rule match reported by the analysis engine.
///
/// Positions are approximate: `line` is 1-based, `column` follows the
/// engine's convention and may be missing or out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule_id: String,
    pub message: String,
    pub severity: Severity,
    pub line: usize,
    pub column: Option<usize>,
    /// Length of the matched node or text, when the engine knows it.
    pub length: Option<usize>,
    /// Syntax node kind used to refine the diagnostic region.
    pub node_kind: Option<String>,
}

/// Byte region in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Region {
    pub offset: usize,
    pub length: usize,
}

impl Region {
    pub fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    pub fn from_range(range: std::ops::Range<usize>) -> Self {
        Self {
            offset: range.start,
            length: range.end.saturating_sub(range.start),
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.end()
    }
}

/// Identity of a diagnostic across analysis runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DiagnosticKey {
    pub rule_id: String,
    pub offset: usize,
    pub length: usize,
}

/// A resolved finding, ready for the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    /// 1-based line of `region.offset`.
    pub line: usize,
    pub region: Region,
}

impl Diagnostic {
    pub fn key(&self) -> DiagnosticKey {
        DiagnosticKey {
            rule_id: self.rule_id.clone(),
            offset: self.region.offset,
            length: self.region.length,
        }
    }
}

/// The reconciled changes for one file from one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticBatch {
    pub retract: Vec<DiagnosticKey>,
    pub post: Vec<Diagnostic>,
}

impl DiagnosticBatch {
    pub fn is_empty(&self) -> bool {
        self.retract.is_empty() && self.post.is_empty()
    }
}

/// Host mechanism for attaching diagnostics to files.
///
/// Implementations serialize their own mutations.
pub trait DiagnosticSink: Send + Sync {
    fn post(&self, file: &Path, diagnostic: &Diagnostic);
    fn retract(&self, file: &Path, key: &DiagnosticKey);
    fn retract_all(&self, file: &Path);

    /// Apply one coherent batch for `file`: retractions first, then posts.
    fn apply_batch(&self, file: &Path, batch: &DiagnosticBatch) {
        for key in &batch.retract {
            self.retract(file, key);
        }
        for diagnostic in &batch.post {
            self.post(file, diagnostic);
        }
    }
}

/// Sink mutation, as recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Post(PathBuf, DiagnosticKey),
    Retract(PathBuf, DiagnosticKey),
    RetractAll(PathBuf),
}

#[derive(Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, BTreeMap<DiagnosticKey, Diagnostic>>,
    events: Vec<SinkEvent>,
}

/// In-memory sink keeping the live diagnostics and every mutation.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live diagnostics for `file`, ordered by key.
    pub fn diagnostics(&self, file: &Path) -> Vec<Diagnostic> {
        self.state
            .lock()
            .files
            .get(file)
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every live diagnostic, ordered by file then key.
    pub fn all(&self) -> Vec<Diagnostic> {
        self.state
            .lock()
            .files
            .values()
            .flat_map(|d| d.values().cloned())
            .collect()
    }

    pub fn total(&self) -> usize {
        self.state.lock().files.values().map(BTreeMap::len).sum()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn post(&self, file: &Path, diagnostic: &Diagnostic) {
        let mut state = self.state.lock();
        let key = diagnostic.key();
        state
            .files
            .entry(file.to_path_buf())
            .or_default()
            .insert(key.clone(), diagnostic.clone());
        state.events.push(SinkEvent::Post(file.to_path_buf(), key));
    }

    fn retract(&self, file: &Path, key: &DiagnosticKey) {
        let mut state = self.state.lock();
        let now_empty = match state.files.get_mut(file) {
            Some(diags) => {
                diags.remove(key);
                diags.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.files.remove(file);
        }
        state
            .events
            .push(SinkEvent::Retract(file.to_path_buf(), key.clone()));
    }

    fn retract_all(&self, file: &Path) {
        let mut state = self.state.lock();
        state.files.remove(file);
        state.events.push(SinkEvent::RetractAll(file.to_path_buf()));
    }

    fn apply_batch(&self, file: &Path, batch: &DiagnosticBatch) {
        let mut state = self.state.lock();
        let now_empty = {
            let diags = state.files.entry(file.to_path_buf()).or_default();
            for key in &batch.retract {
                diags.remove(key);
            }
            for diagnostic in &batch.post {
                diags.insert(diagnostic.key(), diagnostic.clone());
            }
            diags.is_empty()
        };
        if now_empty {
            state.files.remove(file);
        }
        for key in &batch.retract {
            state
                .events
                .push(SinkEvent::Retract(file.to_path_buf(), key.clone()));
        }
        for diagnostic in &batch.post {
            state
                .events
                .push(SinkEvent::Post(file.to_path_buf(), diagnostic.key()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    Pretty,
    Json,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ConsoleRecord<'a> {
    Post { diagnostic: &'a Diagnostic },
    Retract { file: &'a Path, key: &'a DiagnosticKey },
    RetractAll { file: &'a Path },
}

/// Streams sink events to stdout, one line per event.
pub struct ConsoleSink {
    format: ConsoleFormat,
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleSink {
    pub fn new(format: ConsoleFormat) -> Self {
        Self::with_writer(format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(format: ConsoleFormat, out: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            out: Mutex::new(out),
        }
    }

    fn emit(&self, record: ConsoleRecord<'_>) {
        let line = match self.format {
            ConsoleFormat::Json => match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!("cannot serialize sink event: {err}");
                    return;
                }
            },
            ConsoleFormat::Pretty => match record {
                ConsoleRecord::Post { diagnostic } => render_pretty(diagnostic),
                ConsoleRecord::Retract { file, key } => format!(
                    "{}: cleared {} at {}+{}",
                    file.display(),
                    key.rule_id,
                    key.offset,
                    key.length
                ),
                ConsoleRecord::RetractAll { file } => format!("{}: cleared", file.display()),
            },
        };
        let mut out = self.out.lock();
        if let Err(err) = writeln!(out, "{line}") {
            tracing::debug!("cannot write sink event: {err}");
        }
    }
}

/// `path:line: severity[rule]: message`
pub fn render_pretty(diagnostic: &Diagnostic) -> String {
    format!(
        "{}:{}: {}[{}]: {}",
        diagnostic.file.display(),
        diagnostic.line,
        diagnostic.severity.as_str(),
        diagnostic.rule_id,
        diagnostic.message
    )
}

impl DiagnosticSink for ConsoleSink {
    fn post(&self, _file: &Path, diagnostic: &Diagnostic) {
        self.emit(ConsoleRecord::Post { diagnostic });
    }

    fn retract(&self, file: &Path, key: &DiagnosticKey) {
        self.emit(ConsoleRecord::Retract { file, key });
    }

    fn retract_all(&self, file: &Path) {
        self.emit(ConsoleRecord::RetractAll { file });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(rule: &str, offset: usize) -> Diagnostic {
        Diagnostic {
            file: PathBuf::from("a.move"),
            rule_id: rule.to_string(),
            severity: Severity::Warning,
            message: "m".to_string(),
            line: 1,
            region: Region::new(offset, 2),
        }
    }

    #[test]
    fn memory_sink_batches_keep_state_consistent() {
        let sink = MemorySink::new();
        let file = Path::new("a.move");
        sink.apply_batch(
            file,
            &DiagnosticBatch {
                retract: vec![],
                post: vec![diag("r", 0), diag("r", 4)],
            },
        );
        assert_eq!(sink.diagnostics(file).len(), 2);

        sink.apply_batch(
            file,
            &DiagnosticBatch {
                retract: vec![diag("r", 0).key()],
                post: vec![],
            },
        );
        assert_eq!(sink.diagnostics(file), vec![diag("r", 4)]);

        sink.retract_all(file);
        assert_eq!(sink.total(), 0);
        assert_eq!(sink.events().last(), Some(&SinkEvent::RetractAll(file.into())));
    }

    #[test]
    fn pretty_rendering() {
        assert_eq!(render_pretty(&diag("r", 0)), "a.move:1: warning[r]: m");
    }
}
