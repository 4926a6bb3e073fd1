//! Turns engine violations into host diagnostics and keeps the host in sync
//! with the latest run for each file.

use crate::analyzer::CancellationToken;
use crate::diagnostics::{
    Diagnostic, DiagnosticBatch, DiagnosticKey, DiagnosticSink, Region, Violation,
};
use crate::error::{PipelineError, PipelineResult};
use crate::node_finder::{self, FindPolicy, SyntaxTree};
use crate::position::{ColumnBase, LineTable};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tree_sitter::Tree;

/// Counts from one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub posted: usize,
    pub retracted: usize,
    pub unchanged: usize,
    /// Violations whose position could not be resolved.
    pub skipped: usize,
}

/// Diagnostics currently posted for one file.
#[derive(Default)]
struct FileLedger {
    posted: BTreeMap<DiagnosticKey, Diagnostic>,
}

pub struct ViolationProcessor {
    sink: Arc<dyn DiagnosticSink>,
    column_base: ColumnBase,
    ledgers: Mutex<HashMap<PathBuf, Arc<Mutex<FileLedger>>>>,
}

impl ViolationProcessor {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self::with_column_base(sink, ColumnBase::default())
    }

    pub fn with_column_base(sink: Arc<dyn DiagnosticSink>, column_base: ColumnBase) -> Self {
        Self {
            sink,
            column_base,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    fn ledger(&self, file: &Path) -> Arc<Mutex<FileLedger>> {
        self.ledgers
            .lock()
            .entry(file.to_path_buf())
            .or_default()
            .clone()
    }

    /// Resolve `violations` against `source` and reconcile the result with
    /// what is posted for `file`.
    ///
    /// Returns `Cancelled` without touching the sink when `token` was
    /// cancelled before the batch could be issued.
    pub fn apply(
        &self,
        file: &Path,
        source: &str,
        tree: Option<&Tree>,
        violations: &[Violation],
        token: &CancellationToken,
    ) -> PipelineResult<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        let fresh = self.build(file, source, tree, violations, &mut outcome);

        let ledger = self.ledger(file);
        let mut ledger = ledger.lock();
        if token.is_cancelled() {
            return Err(PipelineError::Cancelled(file.to_path_buf()));
        }

        let mut batch = DiagnosticBatch::default();
        for key in ledger.posted.keys() {
            if !fresh.contains_key(key) {
                batch.retract.push(key.clone());
            }
        }
        for (key, diagnostic) in &fresh {
            match ledger.posted.get(key) {
                Some(previous) if previous == diagnostic => outcome.unchanged += 1,
                // Same key, new message or severity: replace, never stack.
                Some(_) => {
                    batch.retract.push(key.clone());
                    batch.post.push(diagnostic.clone());
                }
                None => batch.post.push(diagnostic.clone()),
            }
        }
        outcome.posted = batch.post.len();
        outcome.retracted = batch.retract.len();

        if !batch.is_empty() {
            self.sink.apply_batch(file, &batch);
        }
        ledger.posted = fresh;

        tracing::debug!(
            file = %file.display(),
            posted = outcome.posted,
            retracted = outcome.retracted,
            unchanged = outcome.unchanged,
            skipped = outcome.skipped,
            "diagnostics reconciled"
        );
        Ok(outcome)
    }

    fn build(
        &self,
        file: &Path,
        source: &str,
        tree: Option<&Tree>,
        violations: &[Violation],
        outcome: &mut ApplyOutcome,
    ) -> BTreeMap<DiagnosticKey, Diagnostic> {
        let table = LineTable::with_base(source, self.column_base);
        let adapter = tree.map(|tree| SyntaxTree::new(tree).named_only());
        let mut fresh = BTreeMap::new();

        for violation in violations {
            let resolved = match table.resolve(violation.line, violation.column, violation.length) {
                Ok(resolved) => resolved,
                Err(err) => {
                    tracing::debug!(
                        file = %file.display(),
                        rule = %violation.rule_id,
                        "skipping violation: {err}"
                    );
                    outcome.skipped += 1;
                    continue;
                }
            };

            let mut region = resolved.region;
            let mut line = resolved.line;
            if let (Some(adapter), Some(kind)) = (&adapter, violation.node_kind.as_deref())
                && let Some(node) = node_finder::find(adapter, region, kind, FindPolicy::Innermost)
            {
                let span = Region::from_range(node.start_byte()..node.end_byte());
                if span.length > 0 {
                    region = span;
                    line = table.line_of(region.offset);
                }
            }

            let diagnostic = Diagnostic {
                file: file.to_path_buf(),
                rule_id: violation.rule_id.clone(),
                severity: violation.severity,
                message: violation.message.clone(),
                line,
                region,
            };
            fresh.entry(diagnostic.key()).or_insert(diagnostic);
        }
        fresh
    }

    /// Retract everything posted for `file` and drop its ledger.
    ///
    /// Returns whether anything was posted.
    pub fn forget(&self, file: &Path) -> bool {
        let ledger = self.ledgers.lock().remove(file);
        let Some(ledger) = ledger else {
            return false;
        };
        let mut ledger = ledger.lock();
        let had_any = !ledger.posted.is_empty();
        if had_any {
            self.sink.retract_all(file);
        }
        ledger.posted.clear();
        had_any
    }

    /// Forget every tracked file below `root`. Returns the files that had
    /// diagnostics.
    pub fn forget_under(&self, root: &Path) -> Vec<PathBuf> {
        let files: Vec<PathBuf> = self
            .ledgers
            .lock()
            .keys()
            .filter(|path| path.starts_with(root))
            .cloned()
            .collect();
        files.into_iter().filter(|file| self.forget(file)).collect()
    }

    /// Snapshot of what is posted for `file`.
    pub fn posted(&self, file: &Path) -> Vec<Diagnostic> {
        let ledger = self.ledgers.lock().get(file).cloned();
        ledger
            .map(|l| l.lock().posted.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracked_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.ledgers.lock().keys().cloned().collect();
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{MemorySink, SinkEvent};
    use crate::level::Severity;

    const SOURCE: &str = "line one\nline two\nline three\n";

    fn violation(rule: &str, line: usize, column: usize) -> Violation {
        Violation {
            rule_id: rule.to_string(),
            message: format!("{rule} hit"),
            severity: Severity::Warning,
            line,
            column: Some(column),
            length: Some(4),
            node_kind: None,
        }
    }

    fn setup() -> (Arc<MemorySink>, ViolationProcessor) {
        let sink = Arc::new(MemorySink::new());
        let processor = ViolationProcessor::new(sink.clone());
        (sink, processor)
    }

    #[test]
    fn reconciliation_posts_and_retracts_only_the_difference() {
        let (sink, processor) = setup();
        let file = Path::new("a.move");
        let token = CancellationToken::new();

        let first = [violation("x", 1, 1), violation("y", 2, 1)];
        let outcome = processor.apply(file, SOURCE, None, &first, &token).unwrap();
        assert_eq!(outcome.posted, 2);
        sink.clear_events();

        let second = [violation("y", 2, 1), violation("z", 3, 1)];
        let outcome = processor.apply(file, SOURCE, None, &second, &token).unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome {
                posted: 1,
                retracted: 1,
                unchanged: 1,
                skipped: 0
            }
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SinkEvent::Retract(_, key) if key.rule_id == "x"));
        assert!(matches!(&events[1], SinkEvent::Post(_, key) if key.rule_id == "z"));
        let live: Vec<String> = sink
            .diagnostics(file)
            .into_iter()
            .map(|d| d.rule_id)
            .collect();
        assert_eq!(live, vec!["y".to_string(), "z".to_string()]);
    }

    /// Host sink that only ever appends posts and removes by key.
    #[derive(Default)]
    struct AppendingSink {
        live: Mutex<Vec<Diagnostic>>,
    }

    impl DiagnosticSink for AppendingSink {
        fn post(&self, _file: &Path, diagnostic: &Diagnostic) {
            self.live.lock().push(diagnostic.clone());
        }

        fn retract(&self, _file: &Path, key: &DiagnosticKey) {
            self.live.lock().retain(|d| &d.key() != key);
        }

        fn retract_all(&self, file: &Path) {
            self.live.lock().retain(|d| d.file != file);
        }
    }

    #[test]
    fn changed_message_replaces_the_posted_diagnostic() {
        let sink = Arc::new(AppendingSink::default());
        let processor = ViolationProcessor::new(sink.clone());
        let file = Path::new("a.move");
        let token = CancellationToken::new();

        let mut old = violation("r", 1, 1);
        old.message = "old".into();
        processor.apply(file, SOURCE, None, &[old], &token).unwrap();

        let mut new = violation("r", 1, 1);
        new.message = "new".into();
        let outcome = processor.apply(file, SOURCE, None, &[new], &token).unwrap();
        assert_eq!(outcome.retracted, 1);
        assert_eq!(outcome.posted, 1);

        let live = sink.live.lock();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].message, "new");
        drop(live);

        let outcome = processor
            .apply(file, SOURCE, None, &[violation("r", 1, 1)], &token)
            .unwrap();
        assert_eq!(outcome.unchanged, 0);
        assert_eq!(sink.live.lock().len(), 1);
    }

    #[test]
    fn duplicate_keys_collapse_to_first() {
        let (sink, processor) = setup();
        let file = Path::new("a.move");
        let mut second = violation("x", 1, 1);
        second.message = "later".into();

        let outcome = processor
            .apply(file, SOURCE, None, &[violation("x", 1, 1), second], &CancellationToken::new())
            .unwrap();
        assert_eq!(outcome.posted, 1);
        assert_eq!(sink.diagnostics(file)[0].message, "x hit");
    }

    #[test]
    fn unresolvable_violation_is_skipped() {
        let (sink, processor) = setup();
        let file = Path::new("a.move");
        let outcome = processor
            .apply(
                file,
                SOURCE,
                None,
                &[violation("bad", 0, 1), violation("ok", 2, 1)],
                &CancellationToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.posted, 1);
        assert_eq!(sink.total(), 1);
    }

    #[test]
    fn cancelled_token_posts_nothing() {
        let (sink, processor) = setup();
        let token = CancellationToken::new();
        token.cancel();
        let result = processor.apply(Path::new("a.move"), SOURCE, None, &[violation("x", 1, 1)], &token);
        assert!(matches!(result, Err(PipelineError::Cancelled(_))));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn forget_retracts_everything_for_the_file() {
        let (sink, processor) = setup();
        let token = CancellationToken::new();
        let root = Path::new("/proj");
        processor
            .apply(&root.join("a.move"), SOURCE, None, &[violation("x", 1, 1)], &token)
            .unwrap();
        processor
            .apply(&root.join("b.move"), SOURCE, None, &[], &token)
            .unwrap();

        let forgotten = processor.forget_under(root);
        assert_eq!(forgotten, vec![root.join("a.move")]);
        assert_eq!(sink.total(), 0);
        assert!(processor.tracked_files().is_empty());
        assert!(!processor.forget(&root.join("a.move")));
    }
}
