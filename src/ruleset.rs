//! Rule-set documents and their parsed form.
//!
//! A rule set is a TOML document:
//!
//! ```toml
//! name = "basics"
//! exclude_patterns = ["^tests/"]
//!
//! [[rule]]
//! id = "literal_abort_code"
//! message = "abort with a named constant instead of a literal"
//! priority = 3
//! pattern = "abort\\s+[0-9]+"
//! node_kind = "abort_expression"
//! ```
//!
//! A rule either matches a regex `pattern` (with an optional `node_kind`
//! placement hint) or reports every syntax node of kind `node_kind`.

use crate::error::{PipelineError, PipelineResult};
use crate::level::{HIGHEST_PRIORITY, LOWEST_PRIORITY, Severity};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSetDocument {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default, rename = "rule")]
    rules: Vec<RuleDefinition>,
}

/// Declarative form of a single rule, as written in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    pub id: String,
    pub message: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub node_kind: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_priority() -> u8 {
    3
}

/// How a rule finds violations.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Regex over the source text; `node_kind` refines the diagnostic region.
    Pattern {
        regex: Regex,
        node_kind: Option<String>,
    },
    /// Every syntax node of this kind is a violation.
    NodeKind(String),
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub definition: RuleDefinition,
    pub matcher: RuleMatcher,
}

impl Rule {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn severity(&self) -> Severity {
        Severity::from_priority(self.definition.priority)
    }

    fn compile(definition: RuleDefinition, location: &str) -> PipelineResult<Self> {
        if definition.id.trim().is_empty() {
            return Err(PipelineError::invalid(location, "rule with empty id"));
        }
        if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&definition.priority) {
            return Err(PipelineError::invalid(
                location,
                format!(
                    "rule `{}` has priority {} (expected {HIGHEST_PRIORITY}..={LOWEST_PRIORITY})",
                    definition.id, definition.priority
                ),
            ));
        }

        let matcher = match (&definition.pattern, &definition.node_kind) {
            (Some(pattern), node_kind) => {
                let regex = Regex::new(pattern).map_err(|e| {
                    PipelineError::invalid(
                        location,
                        format!("rule `{}` has an invalid pattern: {e}", definition.id),
                    )
                })?;
                RuleMatcher::Pattern {
                    regex,
                    node_kind: node_kind.clone(),
                }
            }
            (None, Some(kind)) => RuleMatcher::NodeKind(kind.clone()),
            (None, None) => {
                return Err(PipelineError::invalid(
                    location,
                    format!("rule `{}` needs a `pattern` or a `node_kind`", definition.id),
                ));
            }
        };

        Ok(Self {
            definition,
            matcher,
        })
    }
}

/// Parsed form of one rule-set configuration.
#[derive(Debug, Clone)]
pub struct ParsedRuleSet {
    pub name: String,
    pub description: Option<String>,
    pub rules: Vec<Rule>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PartialEq for ParsedRuleSet {
    fn eq(&self, other: &Self) -> bool {
        fn sources(patterns: &[Regex]) -> Vec<&str> {
            patterns.iter().map(Regex::as_str).collect()
        }

        self.name == other.name
            && self.description == other.description
            && self.rules.len() == other.rules.len()
            && self
                .rules
                .iter()
                .zip(&other.rules)
                .all(|(a, b)| a.definition == b.definition)
            && sources(&self.include) == sources(&other.include)
            && sources(&self.exclude) == sources(&other.exclude)
    }
}

impl ParsedRuleSet {
    /// Parse a rule-set document. `location` only labels errors.
    pub fn parse(bytes: &[u8], location: &str) -> PipelineResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PipelineError::invalid(location, format!("not UTF-8: {e}")))?;
        let doc: RuleSetDocument =
            toml::from_str(text).map_err(|e| PipelineError::invalid(location, e))?;

        let mut seen = HashSet::new();
        for def in &doc.rules {
            if !seen.insert(def.id.as_str()) {
                return Err(PipelineError::invalid(
                    location,
                    format!("duplicate rule id `{}`", def.id),
                ));
            }
        }

        let compile_patterns = |patterns: &[String]| -> PipelineResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        PipelineError::invalid(location, format!("invalid file pattern `{p}`: {e}"))
                    })
                })
                .collect()
        };

        let include = compile_patterns(&doc.include_patterns)?;
        let exclude = compile_patterns(&doc.exclude_patterns)?;
        let rules = doc
            .rules
            .into_iter()
            .map(|def| Rule::compile(def, location))
            .collect::<PipelineResult<Vec<_>>>()?;

        Ok(Self {
            name: doc.name,
            description: doc.description,
            rules,
            include,
            exclude,
        })
    }

    /// Whether this rule set applies to a project-relative path.
    ///
    /// An include pattern match always applies; otherwise any exclude match
    /// turns the rule set off for the file.
    pub fn applies_to(&self, relative_path: &str) -> bool {
        if self.include.iter().any(|re| re.is_match(relative_path)) {
            return true;
        }
        !self.exclude.iter().any(|re| re.is_match(relative_path))
    }
}

/// The effective rules for one analysis run.
#[derive(Debug, Clone, Default)]
pub struct MergedRules {
    rules: Vec<Rule>,
}

impl MergedRules {
    /// Merge rule sets in configuration order; the first definition of a rule
    /// id wins. Rules whose priority number exceeds `min_priority` are dropped.
    pub fn merge(sets: &[Arc<ParsedRuleSet>], min_priority: u8) -> Self {
        let rules = sets
            .iter()
            .flat_map(|set| set.rules.iter())
            .unique_by(|rule| rule.id().to_string())
            .filter(|rule| rule.definition.priority <= min_priority)
            .cloned()
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id() == id)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
