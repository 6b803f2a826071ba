//! Deterministic structural analysis and repair of LaTeX documents.
//!
//! The pipeline is strictly sequential per document:
//!
//! 1. [`scan`] builds a [`StructuralModel`] in one left-to-right pass
//! 2. [`classify`] turns the model into an ordered list of [`Defect`]s
//! 3. [`repair`] inserts the closing tokens it can place unambiguously and
//!    reports the rest as residual
//!
//! Everything here is pure and `Send`; nothing performs I/O.
//!
//! # Example
//!
//! ```
//! use theoria_core::latex::{analyze, repair_document, AnalysisOptions};
//!
//! let options = AnalysisOptions::default();
//! let analysis = analyze("\\begin{quote}text", &options).unwrap();
//! assert_eq!(analysis.defects.len(), 1);
//!
//! let report = repair_document("\\begin{quote}text", &options).unwrap();
//! assert_eq!(report.text, "\\begin{quote}text\\end{quote}");
//! ```

mod defect;
mod fence;
mod lexis;
mod model;
mod outline;
mod proptest;
mod repair;
mod scan;

pub use defect::{classify, Defect, DefectKind};
pub use fence::extract_fenced_document;
pub use lexis::locate;
pub use model::{
    BlockClose, BlockFrame, BraceEvent, InlineDelimiter, InlineSpan, OpenArgument, ReferenceSite,
    StrayClose, StructuralModel, UnmatchedBrace,
};
pub use outline::{
    check_label_references, outline, CrossReference, DocumentOutline, IncludeKind, IncludeSite,
    Label, LabelIssue, LabelIssueKind, Section, SectionLevel,
};
pub use repair::{
    apply_edits, repair, EditKind, EditOperation, RepairOptions, RepairReport,
    DEFAULT_BRACE_LOOKAHEAD,
};
pub use scan::{
    is_reference_command, scan, StructureScanner, DEFAULT_MAX_DEPTH, RAW_ENVIRONMENTS,
    REFERENCE_COMMANDS,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Limits for one analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Ceiling for both the block stack and the brace stack
    pub max_nesting_depth: usize,
    /// How far past an open brace its closing brace may be inserted
    pub brace_lookahead: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            max_nesting_depth: DEFAULT_MAX_DEPTH,
            brace_lookahead: DEFAULT_BRACE_LOOKAHEAD,
        }
    }
}

impl AnalysisOptions {
    pub fn with_max_nesting_depth(mut self, depth: usize) -> Self {
        self.max_nesting_depth = depth;
        self
    }

    pub fn with_brace_lookahead(mut self, bytes: usize) -> Self {
        self.brace_lookahead = bytes;
        self
    }

    pub fn repair_options(&self) -> RepairOptions {
        RepairOptions::default().with_brace_lookahead(self.brace_lookahead)
    }
}

/// A structural model together with its classified defects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub model: StructuralModel,
    pub defects: Vec<Defect>,
}

impl Analysis {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    /// Defects of the given kind.
    pub fn of_kind(&self, kind: DefectKind) -> impl Iterator<Item = &Defect> {
        self.defects.iter().filter(move |d| d.kind == kind)
    }
}

/// Scan and classify `text`.
pub fn analyze(text: &str, options: &AnalysisOptions) -> Result<Analysis> {
    let model = scan(text, options.max_nesting_depth)?;
    let defects = classify(&model);
    debug!(len = text.len(), defects = defects.len(), "analyzed document");
    Ok(Analysis { model, defects })
}

/// Analyze `text` and run one repair pass over everything found.
pub fn repair_document(text: &str, options: &AnalysisOptions) -> Result<RepairReport> {
    let analysis = analyze(text, options)?;
    repair(text, &analysis.defects, &options.repair_options())
}
