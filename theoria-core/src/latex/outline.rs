//! Line-oriented document outline: class, packages, sectioning, labels,
//! cross-references and include sites.
//!
//! The outline is text-only. Include sites are recorded but never resolved,
//! since the analyzer performs no file I/O.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::lexis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionLevel {
    Part,
    Chapter,
    Section,
    Subsection,
    Subsubsection,
    Paragraph,
    Subparagraph,
}

impl SectionLevel {
    fn from_command(command: &str) -> Option<Self> {
        Some(match command {
            "part" => Self::Part,
            "chapter" => Self::Chapter,
            "section" => Self::Section,
            "subsection" => Self::Subsection,
            "subsubsection" => Self::Subsubsection,
            "paragraph" => Self::Paragraph,
            "subparagraph" => Self::Subparagraph,
            _ => return None,
        })
    }

    /// Nesting depth, `part` being 0.
    pub fn depth(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub level: SectionLevel,
    pub title: String,
    /// 1-based line
    pub line: usize,
    /// Label defined later on the same line
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReference {
    pub name: String,
    /// Command used, e.g. `eqref`
    pub command: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncludeKind {
    Input,
    Include,
    Subfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeSite {
    pub path: String,
    pub kind: IncludeKind,
    pub line: usize,
}

/// Outline of one document text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentOutline {
    pub document_class: Option<String>,
    pub packages: Vec<String>,
    pub sections: Vec<Section>,
    pub labels: Vec<Label>,
    pub references: Vec<CrossReference>,
    pub includes: Vec<IncludeSite>,
}

struct OutlinePatterns {
    document_class: Regex,
    package: Regex,
    section: Regex,
    label: Regex,
    reference: Regex,
    include: Regex,
}

impl OutlinePatterns {
    fn new() -> Self {
        Self {
            document_class: Regex::new(r"\\documentclass(?:\[[^\]]*\])?\{([^}]+)\}").unwrap(),
            package: Regex::new(r"\\usepackage(?:\[[^\]]*\])?\{([^}]+)\}").unwrap(),
            section: Regex::new(
                r"\\(part|chapter|section|subsection|subsubsection|paragraph|subparagraph)\*?(?:\[[^\]]*\])?\{([^}]+)\}",
            )
            .unwrap(),
            label: Regex::new(r"\\label\{([^}]+)\}").unwrap(),
            reference: Regex::new(
                r"\\(ref|eqref|pageref|autoref|cref|Cref|vref|nameref)\*?\{([^}]+)\}",
            )
            .unwrap(),
            include: Regex::new(r"\\(input|include|subfile)\{([^}]+)\}").unwrap(),
        }
    }
}

fn patterns() -> &'static OutlinePatterns {
    static PATTERNS: OnceLock<OutlinePatterns> = OnceLock::new();
    PATTERNS.get_or_init(OutlinePatterns::new)
}

/// Build the outline of `text`. Comments are stripped before matching.
pub fn outline(text: &str) -> DocumentOutline {
    let patterns = patterns();
    let bytes = text.as_bytes();
    let mut doc = DocumentOutline::default();

    let mut line_start = 0;
    for (index, raw) in text.split('\n').enumerate() {
        let number = index + 1;
        let code_len = lexis::comment_start(bytes, line_start, line_start + raw.len())
            .map(|c| c - line_start)
            .unwrap_or(raw.len());
        let line = &raw[..code_len];
        line_start += raw.len() + 1;

        if doc.document_class.is_none() {
            if let Some(caps) = patterns.document_class.captures(line) {
                doc.document_class = Some(caps[1].trim().to_string());
            }
        }

        for caps in patterns.package.captures_iter(line) {
            doc.packages.extend(
                caps[1]
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from),
            );
        }

        for caps in patterns.section.captures_iter(line) {
            let Some(level) = SectionLevel::from_command(&caps[1]) else {
                continue;
            };
            let after = caps.get(0).map(|m| m.end()).unwrap_or(line.len());
            doc.sections.push(Section {
                level,
                title: caps[2].trim().to_string(),
                line: number,
                label: patterns
                    .label
                    .captures(&line[after..])
                    .map(|l| l[1].trim().to_string()),
            });
        }

        for caps in patterns.label.captures_iter(line) {
            doc.labels.push(Label {
                name: caps[1].trim().to_string(),
                line: number,
            });
        }

        for caps in patterns.reference.captures_iter(line) {
            for name in caps[2].split(',').map(str::trim).filter(|n| !n.is_empty()) {
                doc.references.push(CrossReference {
                    name: name.to_string(),
                    command: caps[1].to_string(),
                    line: number,
                });
            }
        }

        for caps in patterns.include.captures_iter(line) {
            let kind = match &caps[1] {
                "input" => IncludeKind::Input,
                "include" => IncludeKind::Include,
                _ => IncludeKind::Subfile,
            };
            doc.includes.push(IncludeSite {
                path: caps[2].trim().to_string(),
                kind,
                line: number,
            });
        }
    }

    doc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelIssueKind {
    /// Referenced but never labelled
    Undefined,
    /// Labelled more than once
    Duplicate,
    /// Labelled but never referenced
    Unused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelIssue {
    pub kind: LabelIssueKind,
    pub name: String,
    /// Lines of the offending references or labels
    pub lines: Vec<usize>,
}

impl std::fmt::Display for LabelIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            LabelIssueKind::Undefined => "undefined label",
            LabelIssueKind::Duplicate => "duplicate label",
            LabelIssueKind::Unused => "unused label",
        };
        let lines: Vec<String> = self.lines.iter().map(ToString::to_string).collect();
        write!(f, "{what} '{}' (line {})", self.name, lines.join(", "))
    }
}

/// Cross-check labels against references.
///
/// Issues are grouped by kind (undefined, duplicate, unused) and sorted by
/// name within each group.
pub fn check_label_references(outline: &DocumentOutline) -> Vec<LabelIssue> {
    let mut label_lines: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for label in &outline.labels {
        label_lines.entry(&label.name).or_default().push(label.line);
    }
    let mut ref_lines: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for reference in &outline.references {
        ref_lines
            .entry(&reference.name)
            .or_default()
            .push(reference.line);
    }
    let labelled: BTreeSet<&str> = label_lines.keys().copied().collect();

    let mut issues = Vec::new();
    for (name, lines) in &ref_lines {
        if !labelled.contains(name) {
            issues.push(LabelIssue {
                kind: LabelIssueKind::Undefined,
                name: name.to_string(),
                lines: lines.clone(),
            });
        }
    }
    for (name, lines) in &label_lines {
        if lines.len() > 1 {
            issues.push(LabelIssue {
                kind: LabelIssueKind::Duplicate,
                name: name.to_string(),
                lines: lines.clone(),
            });
        }
    }
    for (name, lines) in &label_lines {
        if !ref_lines.contains_key(name) {
            issues.push(LabelIssue {
                kind: LabelIssueKind::Unused,
                name: name.to_string(),
                lines: lines.clone(),
            });
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAPER: &str = r"\documentclass[11pt]{article}
\usepackage{amsmath, amssymb}
\usepackage[utf8]{inputenc}
\begin{document}
\section{Introduction}\label{sec:intro}
As shown in Section~\ref{sec:method} and Eq.~\eqref{eq:main}.
% \section{Commented out}
\subsection*{Background}
\input{chapters/background}
\section{Method}\label{sec:method}
\begin{equation}\label{eq:main} x = y \end{equation}
\label{sec:method}
\cref{fig:missing,sec:intro}
\end{document}
";

    #[test]
    fn test_outline_header() {
        let doc = outline(PAPER);
        assert_eq!(doc.document_class.as_deref(), Some("article"));
        assert_eq!(doc.packages, vec!["amsmath", "amssymb", "inputenc"]);
    }

    #[test]
    fn test_outline_sections_skip_comments() {
        let doc = outline(PAPER);
        let titles: Vec<_> = doc.sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Introduction", "Background", "Method"]);
        assert_eq!(doc.sections[0].label.as_deref(), Some("sec:intro"));
        assert_eq!(doc.sections[0].line, 5);
        assert_eq!(doc.sections[1].level, SectionLevel::Subsection);
        assert_eq!(doc.sections[1].label, None);
    }

    #[test]
    fn test_outline_includes_and_references() {
        let doc = outline(PAPER);
        assert_eq!(
            doc.includes,
            vec![IncludeSite {
                path: "chapters/background".into(),
                kind: IncludeKind::Input,
                line: 9
            }]
        );
        let commands: Vec<_> = doc.references.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["ref", "eqref", "cref", "cref"]);
    }

    #[test]
    fn test_label_reference_issues() {
        let issues = check_label_references(&outline(PAPER));
        let summary: Vec<_> = issues
            .iter()
            .map(|i| (i.kind, i.name.as_str(), i.lines.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (LabelIssueKind::Undefined, "fig:missing", vec![13]),
                (LabelIssueKind::Duplicate, "sec:method", vec![10, 12]),
            ]
        );
    }

    #[test]
    fn test_unused_label() {
        let issues = check_label_references(&outline("\\label{a}\n\\ref{b}\n"));
        let kinds: Vec<_> = issues.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![LabelIssueKind::Undefined, LabelIssueKind::Unused]);
    }

    #[test]
    fn test_escaped_percent_is_not_a_comment() {
        let doc = outline("50\\% done \\label{progress}");
        assert_eq!(doc.labels.len(), 1);
    }

    #[test]
    fn test_section_depth() {
        assert!(SectionLevel::Chapter.depth() < SectionLevel::Subsection.depth());
    }
}
