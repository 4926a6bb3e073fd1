//! Text edits anchored on diagnostic regions and syntax nodes.
//!
//! Everything here is pure: edits are computed and applied on strings using
//! byte offsets, the same unit diagnostics and trees use.

use crate::diagnostics::{Diagnostic, Region};
use crate::node_finder::{self, FindPolicy, SyntaxTree, TreeAdapter};
use thiserror::Error;
use tree_sitter::Tree;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("edits overlap at byte {0}")]
    Overlapping(usize),

    #[error("edit {start}..{end} exceeds source length {source_len}")]
    OutOfBounds {
        start: usize,
        end: usize,
        source_len: usize,
    },

    #[error("edit boundary {0} is not on a character boundary")]
    NotCharBoundary(usize),
}

/// Replace the bytes of `region` with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub region: Region,
    pub replacement: String,
}

impl TextEdit {
    pub fn replace(region: Region, replacement: impl Into<String>) -> Self {
        Self {
            region,
            replacement: replacement.into(),
        }
    }

    pub fn delete(region: Region) -> Self {
        Self::replace(region, String::new())
    }

    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self::replace(Region::new(offset, 0), text)
    }

    /// Replace exactly the text a diagnostic points at.
    pub fn for_diagnostic(diagnostic: &Diagnostic, replacement: impl Into<String>) -> Self {
        Self::replace(diagnostic.region, replacement)
    }

    pub fn overlaps_with(&self, other: &TextEdit) -> bool {
        self.region.offset < other.region.end() && other.region.offset < self.region.end()
    }

    fn validate(&self, source: &str) -> Result<(), EditError> {
        let (start, end) = (self.region.offset, self.region.end());
        if end > source.len() {
            return Err(EditError::OutOfBounds {
                start,
                end,
                source_len: source.len(),
            });
        }
        for boundary in [start, end] {
            if !source.is_char_boundary(boundary) {
                return Err(EditError::NotCharBoundary(boundary));
            }
        }
        Ok(())
    }
}

pub fn validate_edits(source: &str, edits: &[TextEdit]) -> Result<(), EditError> {
    for edit in edits {
        edit.validate(source)?;
    }

    let mut sorted: Vec<&TextEdit> = edits.iter().collect();
    sorted.sort_by_key(|e| (e.region.offset, e.region.end()));
    for pair in sorted.windows(2) {
        if pair[0].overlaps_with(pair[1]) {
            return Err(EditError::Overlapping(pair[1].region.offset));
        }
    }
    Ok(())
}

/// Apply non-overlapping edits, in any order.
///
/// ```rust
/// use move_clippy_incremental::diagnostics::Region;
/// use move_clippy_incremental::fix::{TextEdit, apply_edits};
///
/// let source = "abort 7";
/// let edits = vec![TextEdit::replace(Region::new(6, 1), "E_LIMIT")];
/// assert_eq!(apply_edits(source, &edits).unwrap(), "abort E_LIMIT");
/// ```
pub fn apply_edits(source: &str, edits: &[TextEdit]) -> Result<String, EditError> {
    validate_edits(source, edits)?;

    let mut sorted = edits.to_vec();
    sorted.sort_by(|a, b| b.region.offset.cmp(&a.region.offset));

    let mut result = source.to_string();
    for edit in sorted {
        result.replace_range(edit.region.range(), &edit.replacement);
    }
    Ok(result)
}

/// Edit replacing the node of `kind` that `policy` selects for `region`.
pub fn replace_enclosing(
    tree: &Tree,
    region: Region,
    kind: &str,
    policy: FindPolicy,
    replacement: impl Into<String>,
) -> Option<TextEdit> {
    let adapter = SyntaxTree::new(tree);
    let node = node_finder::find(&adapter, region, kind, policy)?;
    let span = Region::from_range(adapter.span_of(node));
    Some(TextEdit::replace(span, replacement))
}
