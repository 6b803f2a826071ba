//! Deterministic repair of structural defects.
//!
//! All edits of one pass are computed against the same snapshot and applied
//! highest start first, so no edit ever shifts the recorded position of
//! another. The engine only inserts; it never deletes or rewrites content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::defect::{Defect, DefectKind};
use super::lexis;
use super::model::InlineDelimiter;
use crate::error::{Error, Result};

/// Default distance, in bytes, a brace anchor may lie past its brace.
pub const DEFAULT_BRACE_LOOKAHEAD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditKind {
    Insert,
    Replace,
    Delete,
}

/// One text edit against a fixed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOperation {
    pub kind: EditKind,
    pub start: usize,
    /// Exclusive end; absent for inserts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<usize>,
    /// Replacement text; absent for deletes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl EditOperation {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self {
            kind: EditKind::Insert,
            start: at,
            end: None,
            text: Some(text.into()),
        }
    }

    pub fn replace(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            kind: EditKind::Replace,
            start,
            end: Some(end),
            text: Some(text.into()),
        }
    }

    pub fn delete(start: usize, end: usize) -> Self {
        Self {
            kind: EditKind::Delete,
            start,
            end: Some(end),
            text: None,
        }
    }

    /// End of the replaced range; equal to `start` for inserts.
    pub fn span_end(&self) -> usize {
        match self.kind {
            EditKind::Insert => self.start,
            EditKind::Replace | EditKind::Delete => self.end.unwrap_or(self.start),
        }
    }

    fn replacement(&self) -> &str {
        match self.kind {
            EditKind::Delete => "",
            EditKind::Insert | EditKind::Replace => self.text.as_deref().unwrap_or(""),
        }
    }
}

/// Apply edits computed against `text`, highest start first.
///
/// Fails with [`Error::EditConflict`] when an edit falls outside the text or
/// off a character boundary, when ranges overlap, or when two edits share a
/// start offset.
pub fn apply_edits(text: &str, edits: &[EditOperation]) -> Result<String> {
    let mut ordered: Vec<&EditOperation> = edits.iter().collect();
    ordered.sort_by_key(|e| e.start);

    for edit in &ordered {
        let end = edit.span_end();
        if end < edit.start || end > text.len() {
            return Err(Error::EditConflict(format!(
                "edit {}..{} outside document of {} bytes",
                edit.start,
                end,
                text.len()
            )));
        }
        if !text.is_char_boundary(edit.start) || !text.is_char_boundary(end) {
            return Err(Error::EditConflict(format!(
                "edit {}..{} splits a character",
                edit.start, end
            )));
        }
    }
    for pair in ordered.windows(2) {
        if pair[0].start == pair[1].start {
            return Err(Error::EditConflict(format!(
                "two edits start at offset {}",
                pair[0].start
            )));
        }
        if pair[0].span_end() > pair[1].start {
            return Err(Error::EditConflict(format!(
                "edit {}..{} overlaps edit at {}",
                pair[0].start,
                pair[0].span_end(),
                pair[1].start
            )));
        }
    }

    let mut result = text.to_string();
    for edit in ordered.iter().rev() {
        result.replace_range(edit.start..edit.span_end(), edit.replacement());
    }
    Ok(result)
}

/// Repair tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairOptions {
    pub brace_lookahead: usize,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            brace_lookahead: DEFAULT_BRACE_LOOKAHEAD,
        }
    }
}

impl RepairOptions {
    pub fn with_brace_lookahead(mut self, bytes: usize) -> Self {
        self.brace_lookahead = bytes;
        self
    }
}

/// Outcome of one repair pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Repaired text
    pub text: String,
    /// Applied edits, ascending by start
    pub edits: Vec<EditOperation>,
    /// Defects resolved by the edits
    pub fixed: Vec<Defect>,
    /// Defects the engine declined to fix
    pub residual: Vec<Defect>,
}

impl RepairReport {
    pub fn changed(&self) -> bool {
        !self.edits.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.residual.is_empty()
    }
}

/// A closing token destined for one offset.
struct Fragment {
    /// Open position of the construct being closed; later opens nest deeper
    open: usize,
    text: String,
}

/// Decide where a defect's closing token goes, or `None` to leave it residual.
///
/// `open_arguments` holds the positions of commands whose argument brace is
/// never closed; a `}` placed after one of them would close that argument
/// instead of the brace it was meant for.
fn plan(
    text: &str,
    defect: &Defect,
    open_arguments: &[usize],
    options: &RepairOptions,
) -> Option<(usize, String)> {
    let bytes = text.as_bytes();
    let construct = defect.construct.as_deref()?;

    match defect.kind {
        DefectKind::UnclosedBlock => {
            let at = defect.anchor.unwrap_or(text.len());
            Some((at, format!("\\end{{{construct}}}")))
        }
        DefectKind::UnbalancedBrace if construct == "{" => {
            let anchor = defect.anchor?;
            if anchor.saturating_sub(defect.position) > options.brace_lookahead {
                debug!(
                    position = defect.position,
                    anchor, "brace anchor beyond lookahead window"
                );
                return None;
            }
            if open_arguments.iter().any(|&at| at > defect.position && at < anchor) {
                debug!(
                    position = defect.position,
                    anchor, "brace anchor follows an unterminated argument"
                );
                return None;
            }
            Some((anchor, "}".to_string()))
        }
        DefectKind::UnclosedInlineMode => {
            let delimiter = InlineDelimiter::from_token(construct)?;
            let anchor = defect.anchor?;
            // Keep the new delimiter from fusing with a preceding `$`, which
            // also covers an empty region right after its opener.
            let after_dollar = anchor > 0
                && bytes.get(anchor - 1) == Some(&b'$')
                && !lexis::is_escaped(bytes, anchor - 1);
            let separator = if after_dollar { " " } else { "" };
            Some((anchor, format!("{separator}{}", delimiter.as_str())))
        }
        DefectKind::UnbalancedBrace
        | DefectKind::EmptyReferenceArgument
        | DefectKind::StrayBlockClose
        | DefectKind::UnterminatedArgument => None,
    }
}

/// Run one repair pass over `text` for the given defects.
pub fn repair(text: &str, defects: &[Defect], options: &RepairOptions) -> Result<RepairReport> {
    let bytes = text.as_bytes();
    let mut fragments: BTreeMap<usize, Vec<Fragment>> = BTreeMap::new();
    let mut fixed = Vec::new();
    let mut residual = Vec::new();
    let open_arguments: Vec<usize> = defects
        .iter()
        .filter(|d| d.kind == DefectKind::UnterminatedArgument)
        .map(|d| d.position)
        .collect();

    for defect in defects {
        match plan(text, defect, &open_arguments, options) {
            Some((at, token)) if at <= text.len() => {
                fragments.entry(at).or_default().push(Fragment {
                    open: defect.position,
                    text: token,
                });
                fixed.push(defect.clone());
            }
            Some((at, _)) => {
                return Err(Error::EditConflict(format!(
                    "anchor {at} outside document of {} bytes",
                    text.len()
                )));
            }
            None => residual.push(defect.clone()),
        }
    }

    let edits: Vec<EditOperation> = fragments
        .into_iter()
        .map(|(at, mut group)| {
            // Innermost construct closes first.
            group.sort_by(|a, b| b.open.cmp(&a.open));
            let prefix = if (at == text.len() && lexis::last_line_has_comment(bytes))
                || lexis::open_verb_before(bytes, at)
            {
                "\n"
            } else if lexis::is_escaped(bytes, at) || lexis::follows_control_word(bytes, at) {
                " "
            } else {
                ""
            };
            let body: String = group.into_iter().map(|f| f.text).collect();
            EditOperation::insert(at, format!("{prefix}{body}"))
        })
        .collect();

    let repaired = apply_edits(text, &edits)?;
    info!(
        edits = edits.len(),
        fixed = fixed.len(),
        residual = residual.len(),
        "repair pass complete"
    );

    Ok(RepairReport {
        text: repaired,
        edits,
        fixed,
        residual,
    })
}
