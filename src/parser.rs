use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::path::Path;
use tree_sitter::{Language, Parser, Tree};

/// Parses a source file into a tree keyed by byte offsets.
pub trait SyntaxTreeProvider: Send + Sync {
    fn parse(&self, path: &Path, source: &str) -> PipelineResult<Tree>;
}

fn move_language() -> Language {
    tree_sitter_move::language()
}

fn is_allow_directive_line(line_trimmed: &[u8]) -> bool {
    let compact: Vec<u8> = line_trimmed
        .iter()
        .copied()
        .filter(|b| *b != b' ' && *b != b'\t')
        .collect();
    compact.starts_with(b"#![allow(lint::")
}

/// Blank out file-level `#![allow(lint::...)]` lines, which the Move grammar
/// turns into ERROR nodes.
///
/// Byte length and newlines are preserved so tree offsets stay aligned with
/// the original text, which suppression still reads.
fn mask_allow_directives(source: &str) -> Cow<'_, str> {
    if !source.contains("#![") {
        return Cow::Borrowed(source);
    }

    let mut out = source.as_bytes().to_vec();
    let mut line_start = 0usize;
    for line in source.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        let indent = body.len() - body.trim_start_matches([' ', '\t']).len();
        if is_allow_directive_line(&body.as_bytes()[indent..]) {
            for byte in &mut out[line_start + indent..line_start + body.len()] {
                *byte = b' ';
            }
        }
        line_start += line.len();
    }

    match String::from_utf8(out) {
        Ok(s) => Cow::Owned(s),
        Err(_) => Cow::Borrowed(source),
    }
}

pub fn parse_source(source: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(move_language())
        .context("failed to load Move grammar")?;

    let masked = mask_allow_directives(source);

    parser
        .parse(masked.as_ref(), None)
        .context("tree-sitter failed to parse source")
}

/// Tree-sitter provider for Move sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoveTreeProvider {
    /// Treat trees containing ERROR nodes as parse failures.
    pub reject_syntax_errors: bool,
}

impl MoveTreeProvider {
    pub fn strict() -> Self {
        Self {
            reject_syntax_errors: true,
        }
    }
}

impl SyntaxTreeProvider for MoveTreeProvider {
    fn parse(&self, path: &Path, source: &str) -> PipelineResult<Tree> {
        let tree = parse_source(source).map_err(|e| PipelineError::parse_failed(path, format!("{e:#}")))?;
        if self.reject_syntax_errors && tree.root_node().has_error() {
            return Err(PipelineError::parse_failed(path, "source contains syntax errors"));
        }
        Ok(tree)
    }
}
