//! Single-file analysis: rules, source, tree, engine, reconciliation.

use crate::cache::RuleSetCache;
use crate::diagnostics::Violation;
use crate::engine::{AnalysisEngine, EngineInput};
use crate::error::{PipelineError, PipelineResult};
use crate::instrument_block;
use crate::location::RuleSetConfiguration;
use crate::orchestrator::ProjectId;
use crate::parser::SyntaxTreeProvider;
use crate::processor::{ApplyOutcome, ViolationProcessor};
use crate::ruleset::{MergedRules, ParsedRuleSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tree_sitter::Tree;

/// Shared cancellation flag for one analysis request.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once the token is cancelled.
    pub fn check(&self, file: &Path) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled(file.to_path_buf()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub file: PathBuf,
    pub project: ProjectId,
    pub project_root: PathBuf,
    /// Rule-set configurations in precedence order.
    pub configurations: Arc<[RuleSetConfiguration]>,
    pub min_priority: u8,
    /// Unsaved buffer contents; read from disk when absent.
    pub contents: Option<Arc<str>>,
    pub token: CancellationToken,
    pub generation: u64,
}

impl AnalysisRequest {
    /// Path relative to the project root with `/` separators, as matched by
    /// rule-set file patterns.
    pub fn relative_path(&self) -> String {
        let relative = self.file.strip_prefix(&self.project_root).unwrap_or(&self.file);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A rule-set configuration that could not be used for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigurationWarning {
    pub id: u32,
    pub name: String,
    pub message: String,
}

impl fmt::Display for ConfigurationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule set `{}` skipped: {}", self.name, self.message)
    }
}

pub struct AnalysisOutput {
    pub violations: Vec<Violation>,
    pub source: Arc<str>,
    pub tree: Tree,
    pub warnings: Vec<ConfigurationWarning>,
}

#[derive(Debug)]
pub enum AnalysisOutcome {
    Applied(ApplyOutcome),
    Cancelled,
    Failed(PipelineError),
}

#[derive(Debug)]
pub struct AnalysisReport {
    pub file: PathBuf,
    pub outcome: AnalysisOutcome,
    pub warnings: Vec<ConfigurationWarning>,
}

pub struct Analyzer {
    cache: Arc<RuleSetCache>,
    provider: Arc<dyn SyntaxTreeProvider>,
    engine: Arc<dyn AnalysisEngine>,
    processor: Arc<ViolationProcessor>,
}

impl Analyzer {
    pub fn new(
        cache: Arc<RuleSetCache>,
        provider: Arc<dyn SyntaxTreeProvider>,
        engine: Arc<dyn AnalysisEngine>,
        processor: Arc<ViolationProcessor>,
    ) -> Self {
        Self {
            cache,
            provider,
            engine,
            processor,
        }
    }

    pub fn cache(&self) -> &Arc<RuleSetCache> {
        &self.cache
    }

    pub fn processor(&self) -> &Arc<ViolationProcessor> {
        &self.processor
    }

    /// Resolve every configuration; failures become warnings.
    fn resolve_rule_sets(
        &self,
        request: &AnalysisRequest,
    ) -> (Vec<Arc<ParsedRuleSet>>, Vec<ConfigurationWarning>) {
        let mut sets = Vec::new();
        let mut warnings = Vec::new();
        for config in request.configurations.iter() {
            match self.cache.resolve(config) {
                Ok(set) => sets.push(set),
                Err(err) => warnings.push(ConfigurationWarning {
                    id: config.id,
                    name: config.name.clone(),
                    message: err.to_string(),
                }),
            }
        }
        (sets, warnings)
    }

    fn read_source(&self, request: &AnalysisRequest) -> PipelineResult<Arc<str>> {
        match &request.contents {
            Some(contents) => Ok(contents.clone()),
            None => std::fs::read_to_string(&request.file)
                .map(Arc::from)
                .map_err(|e| PipelineError::parse_failed(&request.file, format!("cannot read source: {e}"))),
        }
    }

    /// Resolve, filter and merge the request's rule sets.
    fn prepare_rules(&self, request: &AnalysisRequest) -> (MergedRules, Vec<ConfigurationWarning>) {
        let (sets, warnings) = instrument_block!("resolve", { self.resolve_rule_sets(request) });
        let relative = request.relative_path();
        let applicable: Vec<Arc<ParsedRuleSet>> = sets
            .into_iter()
            .filter(|set| set.applies_to(&relative))
            .collect();
        (MergedRules::merge(&applicable, request.min_priority), warnings)
    }

    /// Read, parse and run the engine with already merged rules.
    fn evaluate(
        &self,
        request: &AnalysisRequest,
        rules: &MergedRules,
    ) -> PipelineResult<(Vec<Violation>, Arc<str>, Tree)> {
        let file = request.file.as_path();
        request.token.check(file)?;

        let source = self.read_source(request)?;
        let tree = instrument_block!("parse", { self.provider.parse(file, &source) })?;
        request.token.check(file)?;

        let violations = if rules.is_empty() {
            Vec::new()
        } else {
            instrument_block!("engine", {
                self.engine.analyze(&EngineInput {
                    file,
                    source: &source,
                    tree: &tree,
                    rules,
                })
            })
            .map_err(|err| match err {
                PipelineError::EngineFailure { .. } | PipelineError::Cancelled(_) => err,
                other => PipelineError::engine(file, other),
            })?
        };
        request.token.check(file)?;
        Ok((violations, source, tree))
    }

    /// Produce violations for one file without touching the sink.
    pub fn analyze(&self, request: &AnalysisRequest) -> PipelineResult<AnalysisOutput> {
        request.token.check(&request.file)?;
        let (rules, warnings) = self.prepare_rules(request);
        let (violations, source, tree) = self.evaluate(request, &rules)?;
        Ok(AnalysisOutput {
            violations,
            source,
            tree,
            warnings,
        })
    }

    /// Analyze and reconcile. Never fails; the outcome says what happened.
    ///
    /// Configuration warnings are reported whatever the outcome.
    pub fn run(&self, request: &AnalysisRequest) -> AnalysisReport {
        let file = request.file.clone();
        if request.token.is_cancelled() {
            return AnalysisReport {
                file,
                outcome: AnalysisOutcome::Cancelled,
                warnings: Vec::new(),
            };
        }

        let (rules, warnings) = self.prepare_rules(request);
        let (violations, source, tree) = match self.evaluate(request, &rules) {
            Ok(evaluated) => evaluated,
            Err(PipelineError::Cancelled(_)) => {
                tracing::debug!(file = %file.display(), generation = request.generation, "analysis superseded");
                return AnalysisReport {
                    file,
                    outcome: AnalysisOutcome::Cancelled,
                    warnings,
                };
            }
            Err(err) => {
                tracing::warn!(file = %file.display(), "analysis failed: {err}");
                return AnalysisReport {
                    file,
                    outcome: AnalysisOutcome::Failed(err),
                    warnings,
                };
            }
        };

        let applied = instrument_block!("reconcile", {
            self.processor.apply(
                &file,
                &source,
                Some(&tree),
                &violations,
                &request.token,
            )
        });
        let outcome = match applied {
            Ok(applied) => AnalysisOutcome::Applied(applied),
            Err(PipelineError::Cancelled(_)) => AnalysisOutcome::Cancelled,
            Err(err) => {
                tracing::warn!(file = %file.display(), "reconciliation failed: {err}");
                AnalysisOutcome::Failed(err)
            }
        };

        AnalysisReport {
            file,
            outcome,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RuleSetSource;
    use crate::diagnostics::MemorySink;
    use crate::engine::PatternEngine;
    use crate::location::{FetchContext, RuleSetLocation};
    use crate::parser::MoveTreeProvider;
    use std::io::Read;

    struct StaticSource(&'static str);

    impl RuleSetSource for StaticSource {
        fn open_stream(
            &self,
            location: &RuleSetLocation,
            _ctx: &FetchContext,
        ) -> PipelineResult<Box<dyn Read + Send>> {
            match location {
                RuleSetLocation::NetworkUri(uri) if uri.contains("missing") => {
                    Err(PipelineError::unreachable(location, "404"))
                }
                _ => Ok(Box::new(std::io::Cursor::new(self.0.as_bytes()))),
            }
        }
    }

    const RULES: &str = r#"
name = "basic"
exclude_patterns = ['^tests/']

[[rule]]
id = "no_abort_literal"
message = "abort with a named constant"
pattern = 'abort\s+\d+'
"#;

    fn analyzer() -> (Arc<MemorySink>, Analyzer) {
        let sink = Arc::new(MemorySink::new());
        let cache = Arc::new(RuleSetCache::new(
            Arc::new(StaticSource(RULES)),
            FetchContext::default(),
        ));
        let analyzer = Analyzer::new(
            cache,
            Arc::new(MoveTreeProvider::default()),
            Arc::new(PatternEngine),
            Arc::new(ViolationProcessor::new(sink.clone())),
        );
        (sink, analyzer)
    }

    fn request(file: &str, contents: &str, uris: &[&str]) -> AnalysisRequest {
        let configurations: Vec<RuleSetConfiguration> = uris
            .iter()
            .enumerate()
            .map(|(i, uri)| {
                RuleSetConfiguration::new(i as u32, *uri, RuleSetLocation::NetworkUri(uri.to_string()))
            })
            .collect();
        AnalysisRequest {
            file: PathBuf::from("/proj").join(file),
            project: ProjectId::from("proj"),
            project_root: PathBuf::from("/proj"),
            configurations: configurations.into(),
            min_priority: 5,
            contents: Some(Arc::from(contents)),
            token: CancellationToken::new(),
            generation: 1,
        }
    }

    const SOURCE: &str = "module a::m;\nfun f() {\n    abort 7\n}\n";

    #[test]
    fn unreachable_configuration_becomes_a_warning() {
        let (sink, analyzer) = analyzer();
        let report = analyzer.run(&request(
            "sources/m.move",
            SOURCE,
            &["https://rules.example/ok.toml", "https://rules.example/missing.toml"],
        ));
        assert!(matches!(report.outcome, AnalysisOutcome::Applied(a) if a.posted == 1));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].id, 1);
        assert_eq!(sink.total(), 1);
    }

    #[test]
    fn excluded_paths_get_no_rules() {
        let (sink, analyzer) = analyzer();
        let report = analyzer.run(&request("tests/m.move", SOURCE, &["https://rules.example/ok.toml"]));
        assert!(matches!(report.outcome, AnalysisOutcome::Applied(a) if a.posted == 0));
        assert_eq!(sink.total(), 0);
    }

    #[test]
    fn cancelled_request_is_reported_as_cancelled() {
        let (sink, analyzer) = analyzer();
        let req = request("sources/m.move", SOURCE, &["https://rules.example/ok.toml"]);
        req.token.cancel();
        assert!(matches!(analyzer.run(&req).outcome, AnalysisOutcome::Cancelled));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn unreadable_file_fails_without_touching_sink() {
        let (sink, analyzer) = analyzer();
        let mut req = request("sources/gone.move", "", &["https://rules.example/ok.toml"]);
        req.contents = None;
        let report = analyzer.run(&req);
        assert!(matches!(
            report.outcome,
            AnalysisOutcome::Failed(PipelineError::ParseFailed { .. })
        ));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn analyze_leaves_the_sink_alone() {
        let (sink, analyzer) = analyzer();
        let output = analyzer
            .analyze(&request("sources/m.move", SOURCE, &["https://rules.example/ok.toml"]))
            .unwrap();
        assert_eq!(output.violations.len(), 1);
        assert_eq!(output.violations[0].line, 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn warnings_survive_a_failed_analysis() {
        let (sink, analyzer) = analyzer();
        let mut req = request(
            "sources/gone.move",
            "",
            &["https://rules.example/ok.toml", "https://rules.example/missing.toml"],
        );
        req.contents = None;
        let report = analyzer.run(&req);
        assert!(matches!(report.outcome, AnalysisOutcome::Failed(_)));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].name, "https://rules.example/missing.toml");
        assert!(sink.events().is_empty());
    }

    #[test]
    fn relative_paths_use_forward_slashes() {
        let req = request("sources/nested/m.move", "", &[]);
        assert_eq!(req.relative_path(), "sources/nested/m.move");
    }
}
