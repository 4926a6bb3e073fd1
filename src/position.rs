//! Line/column to byte-region resolution.
//!
//! A [`LineTable`] is built once per file per run and shared by every
//! violation of that run.

use crate::diagnostics::Region;
use crate::error::{PipelineError, PipelineResult};

/// How the engine counts columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnBase {
    ZeroBased,
    #[default]
    OneBased,
}

/// A resolved position: the region plus the 1-based line it starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub line: usize,
    pub region: Region,
}

pub struct LineTable<'src> {
    source: &'src str,
    /// Byte offset of the first character of each line.
    starts: Vec<usize>,
    base: ColumnBase,
}

impl<'src> LineTable<'src> {
    pub fn new(source: &'src str) -> Self {
        Self::with_base(source, ColumnBase::default())
    }

    pub fn with_base(source: &'src str, base: ColumnBase) -> Self {
        let starts = std::iter::once(0)
            .chain(
                source
                    .bytes()
                    .enumerate()
                    .filter(|(_, b)| *b == b'\n')
                    .map(|(i, _)| i + 1),
            )
            .collect();
        Self {
            source,
            starts,
            base,
        }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    /// Byte range of a 0-based line, excluding its terminator.
    fn line_bounds(&self, index: usize) -> (usize, usize) {
        let start = self.starts[index];
        let mut end = self
            .starts
            .get(index + 1)
            .map(|next| next - 1)
            .unwrap_or(self.source.len());
        if end > start && self.source.as_bytes()[end - 1] == b'\r' {
            end -= 1;
        }
        (start, end)
    }

    /// 1-based line containing `offset`.
    pub fn line_of(&self, offset: usize) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(index) => index + 1,
            Err(index) => index,
        }
    }

    /// 1-based character column of `offset` within its line.
    pub fn column_of(&self, offset: usize) -> usize {
        let start = self.starts[self.line_of(offset) - 1];
        self.source
            .get(start..offset)
            .map(|prefix| prefix.chars().count())
            .unwrap_or(0)
            + 1
    }

    /// Resolve a reported position into a non-empty region.
    pub fn resolve(
        &self,
        line: usize,
        column: Option<usize>,
        length: Option<usize>,
    ) -> PipelineResult<ResolvedLocation> {
        if line == 0 {
            return Err(PipelineError::location(line, column, "lines are 1-based"));
        }

        let len = self.source.len();
        // The empty line after a final terminator holds no character.
        if line > self.line_count() || (len > 0 && self.starts[line - 1] >= len) {
            let offset = self.last_char_offset();
            return Ok(ResolvedLocation {
                line: self.line_of(offset),
                region: Region::new(offset, 1),
            });
        }

        let (start, end) = self.line_bounds(line - 1);
        let text = &self.source[start..end];

        let column = column.and_then(|c| match self.base {
            ColumnBase::OneBased => c.checked_sub(1),
            ColumnBase::ZeroBased => Some(c),
        });
        let offset = match column.and_then(|c| text.char_indices().nth(c)) {
            Some((byte, _)) => start + byte,
            None => {
                start
                    + text
                        .char_indices()
                        .find(|(_, ch)| !ch.is_whitespace())
                        .map(|(byte, _)| byte)
                        .unwrap_or(0)
            }
        };

        let length = match length.filter(|l| *l > 0) {
            Some(l) => l.min(len.saturating_sub(offset)),
            None => end.saturating_sub(offset),
        };

        Ok(ResolvedLocation {
            line,
            region: Region::new(offset, length.max(1)),
        })
    }

    /// Offset of the final character, or 0 for empty text.
    fn last_char_offset(&self) -> usize {
        self.source
            .char_indices()
            .next_back()
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}
