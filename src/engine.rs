//! Rule evaluation over one parsed file.

use crate::diagnostics::Violation;
use crate::error::PipelineResult;
use crate::position::LineTable;
use crate::ruleset::{MergedRules, Rule, RuleMatcher};
use crate::suppression::{Suppressions, anchor_item_start_byte};
use std::path::Path;
use tree_sitter::{Node, Tree};

/// Everything an engine sees for one file.
pub struct EngineInput<'a> {
    pub file: &'a Path,
    pub source: &'a str,
    pub tree: &'a Tree,
    pub rules: &'a MergedRules,
}

/// Produces rule violations for a single file.
///
/// Engines must be callable from several worker threads at once.
pub trait AnalysisEngine: Send + Sync {
    fn analyze(&self, input: &EngineInput<'_>) -> PipelineResult<Vec<Violation>>;
}

/// Evaluates `pattern` rules against the text and `node_kind` rules against
/// the syntax tree, honoring source suppressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternEngine;

impl PatternEngine {
    pub fn new() -> Self {
        Self
    }
}

struct Collector<'a> {
    lines: LineTable<'a>,
    tree: &'a Tree,
    suppressions: Suppressions<'a>,
    violations: Vec<Violation>,
}

impl Collector<'_> {
    fn report(&mut self, rule: &Rule, start: usize, end: usize, node_kind: Option<&str>) {
        let line = self.lines.line_of(start);
        let column = self.lines.column_of(start);
        let anchor = self
            .tree
            .root_node()
            .descendant_for_byte_range(start, end)
            .map(anchor_item_start_byte);
        if self.suppressions.is_suppressed(rule.id(), line, anchor) {
            return;
        }

        self.violations.push(Violation {
            rule_id: rule.id().to_string(),
            message: rule.definition.message.clone(),
            severity: rule.severity(),
            line,
            column: Some(column),
            length: Some(end - start),
            node_kind: node_kind.map(str::to_string),
        });
    }
}

fn walk_kind(node: Node, kind: &str, out: &mut Vec<(usize, usize)>) {
    if node.kind() == kind {
        out.push((node.start_byte(), node.end_byte()));
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk_kind(child, kind, out);
    }
}

impl AnalysisEngine for PatternEngine {
    fn analyze(&self, input: &EngineInput<'_>) -> PipelineResult<Vec<Violation>> {
        let mut collector = Collector {
            lines: LineTable::new(input.source),
            tree: input.tree,
            suppressions: Suppressions::scan(input.source),
            violations: Vec::new(),
        };

        for rule in input.rules.rules() {
            if collector.suppressions.is_file_suppressed(rule.id()) {
                continue;
            }
            match &rule.matcher {
                RuleMatcher::Pattern { regex, node_kind } => {
                    for m in regex.find_iter(input.source).filter(|m| !m.is_empty()) {
                        collector.report(rule, m.start(), m.end(), node_kind.as_deref());
                    }
                }
                RuleMatcher::NodeKind(kind) => {
                    let mut spans = Vec::new();
                    walk_kind(input.tree.root_node(), kind, &mut spans);
                    for (start, end) in spans {
                        collector.report(rule, start, end, Some(kind));
                    }
                }
            }
        }

        tracing::trace!(
            file = %input.file.display(),
            violations = collector.violations.len(),
            "engine finished"
        );
        Ok(collector.violations)
    }
}
