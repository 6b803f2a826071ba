//! Structural model produced by the scanner.
//!
//! The model is derived data: it is rebuilt on every analysis and never
//! persisted. All offsets are byte offsets into the scanned text.

use serde::{Deserialize, Serialize};

/// How a block frame left the block stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BlockClose {
    /// Closed by its own `\end{name}` token starting at `at`
    Matched { at: usize },
    /// Popped by an outer `\end` starting at `at`
    Implicit { at: usize },
    /// Still on the stack at end of text
    Open,
}

/// One `\begin{name}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFrame {
    pub name: String,
    /// Offset of the backslash of `\begin`
    pub open: usize,
    /// Offset just past the closing brace of `\begin{name}`
    pub open_end: usize,
    pub close: BlockClose,
}

impl BlockFrame {
    /// Whether this frame was closed by its own end token.
    pub fn is_matched(&self) -> bool {
        matches!(self.close, BlockClose::Matched { .. })
    }
}

/// An `\end{name}` with no open frame of that name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrayClose {
    pub name: String,
    pub offset: usize,
}

/// Inline math delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineDelimiter {
    /// `$ ... $`
    Dollar,
    /// `$$ ... $$`
    DoubleDollar,
}

impl InlineDelimiter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dollar => "$",
            Self::DoubleDollar => "$$",
        }
    }

    pub fn len(&self) -> usize {
        self.as_str().len()
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "$" => Some(Self::Dollar),
            "$$" => Some(Self::DoubleDollar),
            _ => None,
        }
    }
}

/// A math-mode region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineSpan {
    pub delimiter: InlineDelimiter,
    /// Offset of the opening delimiter
    pub start: usize,
    /// Offset just past the closing delimiter, `None` when unterminated
    pub end: Option<usize>,
    /// For unterminated regions: end of the last significant content of the
    /// paragraph. Equal to the content start when the region is empty.
    pub content_end: usize,
}

impl InlineSpan {
    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    /// Offset just past the opening delimiter.
    pub fn content_start(&self) -> usize {
        self.start + self.delimiter.len()
    }
}

/// Brace depth after the brace at `offset` was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BraceEvent {
    pub offset: usize,
    pub depth: usize,
}

/// An open brace that was never closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedBrace {
    pub offset: usize,
    /// Content end of the brace's own line
    pub anchor: usize,
}

/// A reference or citation command occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSite {
    /// Command name without the backslash, e.g. `cite`
    pub command: String,
    /// Raw text between the argument braces
    pub argument: String,
    /// Offset of the command's backslash
    pub offset: usize,
    /// Byte range of the argument text
    pub argument_span: (usize, usize),
}

impl ReferenceSite {
    /// Whether the argument is empty or whitespace only.
    pub fn is_empty(&self) -> bool {
        self.argument.trim().is_empty()
    }

    /// Comma-separated keys of the argument.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.argument
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// A `\begin`, `\end` or reference command whose argument brace never closes
/// within its paragraph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenArgument {
    /// Command name without the backslash
    pub command: String,
    /// Offset of the command's backslash
    pub offset: usize,
    /// Offset of the unclosed `{`
    pub brace: usize,
}

/// Everything the scanner learned about a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralModel {
    /// Length of the scanned text in bytes
    pub len: usize,
    /// Block frames in open order
    pub blocks: Vec<BlockFrame>,
    pub stray_closes: Vec<StrayClose>,
    /// Inline regions in open order; never overlapping
    pub inline_spans: Vec<InlineSpan>,
    pub brace_trace: Vec<BraceEvent>,
    pub unmatched_opens: Vec<UnmatchedBrace>,
    /// Offsets of close braces that would have taken the depth below zero
    pub unmatched_closes: Vec<usize>,
    pub references: Vec<ReferenceSite>,
    /// Argument braces left open; they take no part in brace matching
    pub open_arguments: Vec<OpenArgument>,
}

impl StructuralModel {
    /// Frames still open at end of text, outermost first.
    pub fn open_blocks(&self) -> impl Iterator<Item = &BlockFrame> {
        self.blocks
            .iter()
            .filter(|b| matches!(b.close, BlockClose::Open))
    }

    /// Frames that were closed by something other than their own end token.
    pub fn unclosed_blocks(&self) -> impl Iterator<Item = &BlockFrame> {
        self.blocks.iter().filter(|b| !b.is_matched())
    }

    pub fn unterminated_spans(&self) -> impl Iterator<Item = &InlineSpan> {
        self.inline_spans.iter().filter(|s| !s.is_terminated())
    }

    pub fn empty_references(&self) -> impl Iterator<Item = &ReferenceSite> {
        self.references.iter().filter(|r| r.is_empty())
    }

    /// Brace depth at end of text.
    pub fn final_brace_depth(&self) -> usize {
        self.brace_trace.last().map(|e| e.depth).unwrap_or(0)
    }

    /// Whether the block stack was empty at end of text.
    pub fn is_closed(&self) -> bool {
        self.open_blocks().next().is_none()
    }

    /// Whether no structural anomaly of any kind was recorded.
    pub fn is_well_formed(&self) -> bool {
        self.unclosed_blocks().next().is_none()
            && self.stray_closes.is_empty()
            && self.unterminated_spans().next().is_none()
            && self.unmatched_opens.is_empty()
            && self.unmatched_closes.is_empty()
            && self.empty_references().next().is_none()
            && self.open_arguments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_keys() {
        let site = ReferenceSite {
            command: "cite".into(),
            argument: " knuth84, lamport94 ,".into(),
            offset: 0,
            argument_span: (6, 27),
        };
        assert!(!site.is_empty());
        assert_eq!(site.keys().collect::<Vec<_>>(), vec!["knuth84", "lamport94"]);
    }

    #[test]
    fn test_delimiter_tokens() {
        assert_eq!(InlineDelimiter::from_token("$$"), Some(InlineDelimiter::DoubleDollar));
        assert_eq!(InlineDelimiter::DoubleDollar.len(), 2);
        assert_eq!(InlineDelimiter::from_token("\\("), None);
    }

    #[test]
    fn test_empty_model_is_closed() {
        let model = StructuralModel::default();
        assert!(model.is_closed());
        assert!(model.is_well_formed());
        assert_eq!(model.final_brace_depth(), 0);
    }
}
