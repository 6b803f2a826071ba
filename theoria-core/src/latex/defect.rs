//! Defect classification over a structural model.

use serde::{Deserialize, Serialize};

use super::lexis;
use super::model::{BlockClose, StructuralModel};

/// Kinds of structural defect, declared in tie-break priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefectKind {
    UnclosedBlock,
    UnbalancedBrace,
    UnclosedInlineMode,
    EmptyReferenceArgument,
    StrayBlockClose,
    UnterminatedArgument,
}

impl DefectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnclosedBlock => "unclosed-block",
            Self::UnbalancedBrace => "unbalanced-brace",
            Self::UnclosedInlineMode => "unclosed-inline-mode",
            Self::EmptyReferenceArgument => "empty-reference-argument",
            Self::StrayBlockClose => "stray-block-close",
            Self::UnterminatedArgument => "unterminated-argument",
        }
    }
}

impl std::fmt::Display for DefectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified structural finding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Defect {
    pub kind: DefectKind,
    /// Byte offset of the offending construct
    pub position: usize,
    /// Environment name, brace character, delimiter or command name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub construct: Option<String>,
    /// Where the scanner decided the construct should have been closed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<usize>,
}

impl Defect {
    pub fn new(kind: DefectKind, position: usize) -> Self {
        Self {
            kind,
            position,
            construct: None,
            anchor: None,
        }
    }

    pub fn with_construct(mut self, construct: impl Into<String>) -> Self {
        self.construct = Some(construct.into());
        self
    }

    pub fn with_anchor(mut self, anchor: usize) -> Self {
        self.anchor = Some(anchor);
        self
    }

    /// Human-readable description without location.
    pub fn describe(&self) -> String {
        let construct = self.construct.as_deref().unwrap_or("?");
        match self.kind {
            DefectKind::UnclosedBlock => format!("Unclosed environment: {construct}"),
            DefectKind::UnbalancedBrace if construct == "}" => {
                "Closing brace without a matching opening brace".to_string()
            }
            DefectKind::UnbalancedBrace => "Opening brace is never closed".to_string(),
            DefectKind::UnclosedInlineMode => {
                format!("Math mode opened with '{construct}' is never closed")
            }
            DefectKind::EmptyReferenceArgument => format!("Empty argument to \\{construct}"),
            DefectKind::StrayBlockClose => {
                format!("\\end{{{construct}}} without a matching \\begin")
            }
            DefectKind::UnterminatedArgument => {
                format!("Argument of \\{construct} is never closed")
            }
        }
    }

    /// Description prefixed with the 1-based line and column in `text`.
    pub fn describe_in(&self, text: &str) -> String {
        let (line, column) = lexis::locate(text, self.position);
        format!("line {line}, column {column}: {}", self.describe())
    }
}

/// Classify every anomaly recorded in the model.
///
/// The result is sorted by position, then by kind priority. Sorting is stable
/// so equal keys keep model order.
pub fn classify(model: &StructuralModel) -> Vec<Defect> {
    let mut defects = Vec::new();

    for frame in &model.blocks {
        let defect = Defect::new(DefectKind::UnclosedBlock, frame.open).with_construct(&frame.name);
        match frame.close {
            BlockClose::Matched { .. } => {}
            BlockClose::Implicit { at } => defects.push(defect.with_anchor(at)),
            BlockClose::Open => defects.push(defect),
        }
    }

    for brace in &model.unmatched_opens {
        defects.push(
            Defect::new(DefectKind::UnbalancedBrace, brace.offset)
                .with_construct("{")
                .with_anchor(brace.anchor),
        );
    }
    for &offset in &model.unmatched_closes {
        defects.push(Defect::new(DefectKind::UnbalancedBrace, offset).with_construct("}"));
    }

    for span in model.unterminated_spans() {
        defects.push(
            Defect::new(DefectKind::UnclosedInlineMode, span.start)
                .with_construct(span.delimiter.as_str())
                .with_anchor(span.content_end),
        );
    }

    for site in model.empty_references() {
        defects.push(
            Defect::new(DefectKind::EmptyReferenceArgument, site.offset)
                .with_construct(&site.command),
        );
    }

    for stray in &model.stray_closes {
        defects.push(
            Defect::new(DefectKind::StrayBlockClose, stray.offset).with_construct(&stray.name),
        );
    }

    for argument in &model.open_arguments {
        defects.push(
            Defect::new(DefectKind::UnterminatedArgument, argument.offset)
                .with_construct(&argument.command),
        );
    }

    defects.sort_by_key(|d| (d.position, d.kind));
    defects
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latex::scan::{scan, DEFAULT_MAX_DEPTH};
    use pretty_assertions::assert_eq;

    fn defects(text: &str) -> Vec<Defect> {
        classify(&scan(text, DEFAULT_MAX_DEPTH).unwrap())
    }

    #[test]
    fn test_clean_document() {
        let text = "\\begin{document}\nSee \\cite{knuth84} and $x^{2}$.\n\\end{document}\n";
        assert!(defects(text).is_empty());
    }

    #[test]
    fn test_unclosed_block_at_open_position() {
        assert_eq!(
            defects("\\begin{quote}text"),
            vec![Defect::new(DefectKind::UnclosedBlock, 0).with_construct("quote")]
        );
    }

    #[test]
    fn test_unclosed_inline_mode() {
        let found = defects("cost is $5 and rises");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, DefectKind::UnclosedInlineMode);
        assert_eq!(found[0].position, 8);
        assert_eq!(found[0].construct.as_deref(), Some("$"));
        assert_eq!(found[0].anchor, Some(20));
    }

    #[test]
    fn test_empty_reference_argument() {
        assert_eq!(
            defects("\\cite{}"),
            vec![Defect::new(DefectKind::EmptyReferenceArgument, 0).with_construct("cite")]
        );
    }

    #[test]
    fn test_one_brace_defect_per_unmatched_open() {
        let found = defects("{a {b\n}");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].position, 0);
        assert_eq!(found[0].anchor, Some(5));
    }

    #[test]
    fn test_unmatched_close_brace() {
        let found = defects("a } b");
        assert_eq!(found[0].kind, DefectKind::UnbalancedBrace);
        assert_eq!(found[0].construct.as_deref(), Some("}"));
        assert_eq!(found[0].anchor, None);
    }

    #[test]
    fn test_unterminated_arguments() {
        let found = defects("\\begin{quote\n\\cite{a,");
        assert_eq!(
            found,
            vec![
                Defect::new(DefectKind::UnterminatedArgument, 0).with_construct("begin"),
                Defect::new(DefectKind::UnterminatedArgument, 13).with_construct("cite"),
            ]
        );
        assert_eq!(found[1].describe(), "Argument of \\cite is never closed");
    }

    #[test]
    fn test_implicitly_closed_block_carries_anchor() {
        let text = "\\begin{quote}\\begin{itemize}\\item a\\end{quote}";
        let found = defects(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].construct.as_deref(), Some("itemize"));
        assert_eq!(found[0].anchor, Some(text.find("\\end").unwrap()));
    }

    #[test]
    fn test_ties_break_by_kind_priority() {
        // The block and the brace both start at offset 0.
        let model = StructuralModel {
            len: 10,
            blocks: vec![crate::latex::model::BlockFrame {
                name: "x".into(),
                open: 0,
                open_end: 9,
                close: BlockClose::Open,
            }],
            unmatched_closes: vec![0],
            ..Default::default()
        };
        let kinds: Vec<_> = classify(&model).iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DefectKind::UnclosedBlock, DefectKind::UnbalancedBrace]);
    }

    #[test]
    fn test_ordering_by_position() {
        let text = "\\ref{} {x $y\n\n\\end{foo} \\begin{bar}";
        let kinds: Vec<_> = defects(text).iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DefectKind::EmptyReferenceArgument,
                DefectKind::UnbalancedBrace,
                DefectKind::UnclosedInlineMode,
                DefectKind::StrayBlockClose,
                DefectKind::UnclosedBlock,
            ]
        );
    }

    #[test]
    fn test_describe_in_reports_line_and_column() {
        let text = "first line\n  \\begin{quote}";
        let found = defects(text);
        assert_eq!(
            found[0].describe_in(text),
            "line 2, column 3: Unclosed environment: quote"
        );
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&DefectKind::UnclosedInlineMode).unwrap();
        assert_eq!(json, "\"unclosed-inline-mode\"");
    }
}
