//! Source-level suppression of rule violations.
//!
//! Three forms are honored:
//! - `#![allow(lint::rule)]` anywhere in the file header suppresses the rule
//!   for the whole file,
//! - `#[allow(lint::rule)]` in the attribute block before an item suppresses
//!   it inside that item,
//! - a `// NOLINT` or `// NOLINT(rule_a, rule_b)` comment suppresses
//!   violations reported on its own line.

use std::collections::{HashMap, HashSet};
use tree_sitter::Node;

const NOLINT: &str = "NOLINT";

fn is_item_kind(kind: &str) -> bool {
    // Only definitions anchor directives; `function_identifier` and friends
    // sit inside the item.
    if !(kind.ends_with("_definition") || kind.ends_with("_declaration")) {
        return false;
    }

    kind.contains("module")
        || kind.contains("use")
        || kind.contains("function")
        || kind.contains("struct")
        || kind.contains("datatype")
        || kind.contains("enum")
        || kind.contains("constant")
}

/// Byte offset of the enclosing item used as a suppression anchor.
pub fn anchor_item_start_byte(node: Node) -> usize {
    if is_item_kind(node.kind()) {
        return node.start_byte();
    }

    let mut cur = node;
    while let Some(parent) = cur.parent() {
        if is_item_kind(parent.kind()) {
            return parent.start_byte();
        }
        cur = parent;
    }

    node.start_byte()
}

/// Rule named by an `allow(lint::...)` attribute line, if any.
fn parse_allow(line: &str, file_level: bool) -> Option<String> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    let prefix = if file_level {
        "#![allow(lint::"
    } else {
        "#[allow(lint::"
    };
    let name = compact.strip_prefix(prefix)?.strip_suffix(")]")?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Rules allowed by the attribute block immediately preceding `item_start_byte`.
fn item_allows(source: &str, item_start_byte: usize) -> HashSet<String> {
    let Some(before_item) = source.get(..item_start_byte) else {
        return HashSet::new();
    };

    let mut start = before_item.len().saturating_sub(4096);
    while start > 0 && !before_item.is_char_boundary(start) {
        start -= 1;
    }

    let mut allowed = HashSet::new();
    for line in before_item[start..].lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("///") || trimmed.starts_with("//") {
            continue;
        }
        if trimmed.starts_with("#[") {
            allowed.extend(parse_allow(trimmed, false));
            continue;
        }
        break;
    }
    allowed
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LineMarker {
    All,
    Rules(HashSet<String>),
}

impl LineMarker {
    fn covers(&self, rule_id: &str) -> bool {
        match self {
            LineMarker::All => true,
            LineMarker::Rules(rules) => rules.contains(rule_id),
        }
    }
}

fn parse_nolint(line: &str) -> Option<LineMarker> {
    let comment = &line[line.find("//")? + 2..];
    let rest = comment.trim_start().strip_prefix(NOLINT)?;
    let Some(list) = rest.strip_prefix('(') else {
        return Some(LineMarker::All);
    };
    let list = list.split(')').next().unwrap_or_default();
    let rules: HashSet<String> = list
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| r.strip_prefix("lint::").unwrap_or(r).to_string())
        .collect();
    if rules.is_empty() {
        Some(LineMarker::All)
    } else {
        Some(LineMarker::Rules(rules))
    }
}

/// Suppression directives of one source file.
pub struct Suppressions<'src> {
    source: &'src str,
    file_allowed: HashSet<String>,
    /// Keyed by 1-based line.
    markers: HashMap<usize, LineMarker>,
}

impl<'src> Suppressions<'src> {
    pub fn scan(source: &'src str) -> Self {
        let mut file_allowed = HashSet::new();
        let mut markers = HashMap::new();
        for (index, line) in source.lines().enumerate() {
            if line.trim_start().starts_with("#![") {
                file_allowed.extend(parse_allow(line.trim(), true));
            }
            if line.contains(NOLINT)
                && let Some(marker) = parse_nolint(line)
            {
                markers.insert(index + 1, marker);
            }
        }
        Self {
            source,
            file_allowed,
            markers,
        }
    }

    pub fn is_file_suppressed(&self, rule_id: &str) -> bool {
        self.file_allowed.contains(rule_id)
    }

    /// Whether a violation of `rule_id` reported on `line`, inside the item
    /// anchored at `anchor`, is suppressed.
    pub fn is_suppressed(&self, rule_id: &str, line: usize, anchor: Option<usize>) -> bool {
        if self.is_file_suppressed(rule_id) {
            return true;
        }
        if self.markers.get(&line).is_some_and(|m| m.covers(rule_id)) {
            return true;
        }
        anchor.is_some_and(|start| item_allows(self.source, start).contains(rule_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_level_allow() {
        let src = "#![allow(lint::no_abort)]\nmodule a::b;\n";
        let s = Suppressions::scan(src);
        assert!(s.is_file_suppressed("no_abort"));
        assert!(s.is_suppressed("no_abort", 2, None));
        assert!(!s.is_suppressed("other", 2, None));
    }

    #[test]
    fn nolint_markers() {
        let src = "let a = 1; // NOLINT\nlet b = 2; // NOLINT(rule_x, lint::rule_y)\nlet c = 3;\n";
        let s = Suppressions::scan(src);
        assert!(s.is_suppressed("anything", 1, None));
        assert!(s.is_suppressed("rule_x", 2, None));
        assert!(s.is_suppressed("rule_y", 2, None));
        assert!(!s.is_suppressed("rule_z", 2, None));
        assert!(!s.is_suppressed("rule_x", 3, None));
    }

    #[test]
    fn item_attribute_block() {
        let src = "#[allow(lint::magic)]\n/// Docs.\nfun f() {}\n";
        let anchor = src.find("fun").unwrap();
        let s = Suppressions::scan(src);
        assert!(s.is_suppressed("magic", 3, Some(anchor)));
        assert!(!s.is_suppressed("other", 3, Some(anchor)));
    }

    #[test]
    fn attribute_block_stops_at_code() {
        let src = "#[allow(lint::magic)]\nfun a() {}\nfun f() {}\n";
        let anchor = src.rfind("fun").unwrap();
        let s = Suppressions::scan(src);
        assert!(!s.is_suppressed("magic", 3, Some(anchor)));
    }
}
