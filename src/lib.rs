//! Incremental rule-set analysis for Move projects.
//!
//! After every build of an enabled project the [`BuildOrchestrator`] picks
//! the files to re-analyze, the [`Analyzer`] resolves the project's rule
//! sets through the [`RuleSetCache`], parses the file and runs the engine,
//! and the [`ViolationProcessor`] reconciles the resulting diagnostics with
//! what the host already shows.

#![allow(clippy::new_without_default)]

pub mod analyzer;
pub mod cache;
pub mod cli;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod fix;
pub mod level;
pub mod location;
pub mod node_finder;
pub mod orchestrator;
pub mod parser;
pub mod position;
pub mod processor;
pub mod ruleset;
pub mod suppression;
pub mod telemetry;
pub mod watch;

use std::sync::Arc;

pub use crate::analyzer::{AnalysisRequest, Analyzer, CancellationToken};
pub use crate::cache::RuleSetCache;
pub use crate::diagnostics::{Diagnostic, DiagnosticSink, Region};
pub use crate::error::{PipelineError, PipelineResult};
pub use crate::orchestrator::{BuildDelta, BuildOrchestrator, ProjectId, ProjectSettings};
pub use crate::processor::ViolationProcessor;

use crate::engine::PatternEngine;
use crate::location::FetchContext;
use crate::parser::MoveTreeProvider;

/// Analyzer with the default rule-set source, the Move tree provider and the
/// pattern engine, posting to `sink`.
pub fn create_default_analyzer(ctx: FetchContext, sink: Arc<dyn DiagnosticSink>) -> Analyzer {
    Analyzer::new(
        Arc::new(RuleSetCache::with_default_source(ctx)),
        Arc::new(MoveTreeProvider::default()),
        Arc::new(PatternEngine),
        Arc::new(ViolationProcessor::new(sink)),
    )
}
