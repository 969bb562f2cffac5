use std::fmt;

use ruff_python_ast::ModModule;
use ruff_python_parser::parse_module;
use ruff_text_size::{Ranged, TextRange};
use serde::{Deserialize, Serialize};

/// A position in source code: zero-based line and character column.
///
/// Columns count Unicode scalar values within the line, not bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeLoc {
    pub line: u32,
    pub char: u32,
}

impl CodeLoc {
    #[must_use]
    pub const fn new(line: u32, char: u32) -> Self {
        Self { line, char }
    }
}

/// A half-open source range: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeRange {
    pub start: CodeLoc,
    pub end: CodeLoc,
}

impl CodeRange {
    #[must_use]
    pub const fn new(start: CodeLoc, end: CodeLoc) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for CodeRange {
    /// Human-readable 1-based rendering, used in error messages.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.start.line + 1, self.start.char + 1)
    }
}

/// A single analysis finding with its source range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub range: CodeRange,
}

/// Converts ruff's byte-offset ranges into line/character [`CodeRange`]s.
///
/// Built once per source text from the byte offsets of line starts.
pub(crate) struct SourceMap<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> SourceMap<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { source, line_starts }
    }

    /// Maps a byte offset to a zero-based line/character location.
    pub(crate) fn loc(&self, offset: usize) -> CodeLoc {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let line_start = self.line_starts[line];
        let end = offset.min(self.source.len());
        let char = self.source[line_start..end].chars().count();
        CodeLoc::new(
            u32::try_from(line).unwrap_or(u32::MAX),
            u32::try_from(char).unwrap_or(u32::MAX),
        )
    }

    pub(crate) fn range(&self, range: TextRange) -> CodeRange {
        CodeRange::new(self.loc(range.start().into()), self.loc(range.end().into()))
    }
}

/// Parses source text, mapping the parser's error to a spanned diagnostic.
pub(crate) fn parse_source(source: &str) -> Result<ModModule, Diagnostic> {
    let map = SourceMap::new(source);
    let parsed = parse_module(source).map_err(|e| Diagnostic {
        message: e.to_string(),
        range: map.range(e.range()),
    })?;
    Ok(parsed.into_syntax())
}

/// Analyzes source text for syntax errors without compiling or running it.
///
/// Pure: no session state is created or touched. Diagnostics are ordered by
/// source position with zero-based, end-exclusive ranges.
#[must_use]
pub fn analyze(source: &str) -> Vec<Diagnostic> {
    match parse_source(source) {
        Ok(_) => Vec::new(),
        Err(diagnostic) => vec![diagnostic],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_map_multiline() {
        let map = SourceMap::new("ab\ncde\nf");
        assert_eq!(map.loc(0), CodeLoc::new(0, 0));
        assert_eq!(map.loc(1), CodeLoc::new(0, 1));
        assert_eq!(map.loc(3), CodeLoc::new(1, 0));
        assert_eq!(map.loc(5), CodeLoc::new(1, 2));
        assert_eq!(map.loc(7), CodeLoc::new(2, 0));
    }

    #[test]
    fn source_map_counts_chars_not_bytes() {
        let map = SourceMap::new("x = 'héllo'\ny");
        // é is two bytes; the byte offset after it maps to char column 7
        assert_eq!(map.loc(8), CodeLoc::new(0, 7));
    }

    #[test]
    fn analyze_clean_source() {
        assert_eq!(analyze("x = 1\nprint(x)\n"), vec![]);
    }

    #[test]
    fn analyze_reports_zero_based_range() {
        let diags = analyze("x = (1\n");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].range.start.line, 0);
    }
}
