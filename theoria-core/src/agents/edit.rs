//! LaTeX edit loop: analyze the document, apply the requested edit through
//! the completion capability, then repair whatever structure the edit broke.
//!
//! Analysis and repair never call the model. Repair runs exactly one
//! deterministic pass per entry and always ends the session.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::Message;
use crate::engine::{always, AgentProgram, AgentState, PhaseTable, TurnContext, TurnPolicy};
use crate::error::Result;
use crate::latex::{
    self, check_label_references, extract_fenced_document, AnalysisOptions, Defect, EditOperation,
};

use super::CompletionSettings;

const SYSTEM_PROMPT: &str = "You are Graphos, a LaTeX editing assistant specializing in academic \
document preparation.

Your responsibilities:
- Edit LaTeX documents based on user instructions
- Maintain document structure and formatting consistency
- Preserve existing style and conventions
- Handle citations, references, and cross-references properly

Output ONLY the complete modified LaTeX document in a ```latex block, no explanations.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditPhase {
    Analyze,
    Edit,
    Repair,
    End,
}

impl std::fmt::Display for EditPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Analyze => write!(f, "analyze"),
            Self::Edit => write!(f, "edit"),
            Self::Repair => write!(f, "repair"),
            Self::End => write!(f, "end"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditData {
    /// Current document text
    pub document: String,
    pub instruction: Option<String>,
    /// Defects of the current document, outstanding
    pub defects: Vec<Defect>,
    /// Edits applied by repair passes, in application order
    pub edits: Vec<EditOperation>,
    /// Defects the repair pass left in place
    pub residual: Vec<Defect>,
}

pub type EditState = AgentState<EditPhase, EditData>;

fn has_defects(state: &EditState) -> bool {
    !state.data.defects.is_empty()
}

/// Document editing agent.
pub struct EditAgent {
    table: PhaseTable<EditPhase, EditState>,
    settings: CompletionSettings,
    options: AnalysisOptions,
    max_steps: usize,
}

impl EditAgent {
    pub fn new() -> Result<Self> {
        use EditPhase::*;

        let table = PhaseTable::builder(Analyze)
            .phase(Analyze)
            .phase(Edit)
            .phase(Repair)
            .phase(End)
            .edge(Analyze, "defects found", has_defects, Repair)
            .edge(Analyze, "clean", always, Edit)
            .edge(Edit, "edit broke structure", has_defects, Repair)
            .edge(Edit, "clean", always, End)
            .edge(Repair, "repaired", always, End)
            .build()?;

        Ok(Self {
            table,
            settings: CompletionSettings::default(),
            options: AnalysisOptions::default(),
            max_steps: 8,
        })
    }

    pub fn with_settings(mut self, settings: CompletionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_analysis_options(mut self, options: AnalysisOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// A session state holding `document`.
    pub fn state_for(&self, document: impl Into<String>) -> EditState {
        let mut state = self.initial_state();
        state.data.document = document.into();
        state
    }

    fn report(text: &str, defects: &[Defect]) -> Vec<String> {
        defects.iter().map(|d| format!("- {}", d.describe_in(text))).collect()
    }

    fn analyze(&self, state: &mut EditState) -> Result<()> {
        let document = &state.data.document;
        let analysis = latex::analyze(document, &self.options)?;
        let outline = latex::outline(document);
        let label_issues = check_label_references(&outline);

        let mut lines = vec![format!(
            "Document class: {}; {} package(s), {} section(s), {} label(s).",
            outline.document_class.as_deref().unwrap_or("none"),
            outline.packages.len(),
            outline.sections.len(),
            outline.labels.len()
        )];
        if analysis.defects.is_empty() {
            lines.push("No structural defects.".to_string());
        } else {
            lines.push(format!("{} structural defect(s):", analysis.defects.len()));
            lines.extend(Self::report(document, &analysis.defects));
        }
        for issue in &label_issues {
            lines.push(format!("- note: {issue}"));
        }

        info!(defects = analysis.defects.len(), "document analyzed");
        state.data.defects = analysis.defects;
        state
            .transcript
            .push(tag(Message::assistant(lines.join("\n")), EditPhase::Analyze));
        Ok(())
    }

    async fn edit(&self, state: &mut EditState, cx: &TurnContext<'_>) -> Result<()> {
        let phase = EditPhase::Edit;
        let instruction = state
            .data
            .instruction
            .as_deref()
            .unwrap_or("Tidy the document without changing its meaning.");
        let prompt = format!(
            "{instruction}\n\nCurrent document:\n```latex\n{}\n```",
            state.data.document
        );
        let request = self
            .settings
            .request(phase)
            .with_system(SYSTEM_PROMPT)
            .with_message(Message::user(prompt));
        let response = cx.complete(request).await?;

        let edited = extract_fenced_document(&response.content);
        let defects = latex::analyze(&edited, &self.options)?.defects;
        debug!(defects = defects.len(), "edited document analyzed");

        let mut summary = format!("Document edited ({} bytes).", edited.len());
        if !defects.is_empty() {
            summary.push_str(&format!(
                " The edit introduced {} structural defect(s):\n{}",
                defects.len(),
                Self::report(&edited, &defects).join("\n")
            ));
        }
        state.data.document = edited;
        state.data.defects = defects;
        state.transcript.push(tag(Message::assistant(summary), phase));
        Ok(())
    }

    fn repair(&self, state: &mut EditState) -> Result<()> {
        let report = latex::repair_document(&state.data.document, &self.options)?;
        info!(
            edits = report.edits.len(),
            fixed = report.fixed.len(),
            residual = report.residual.len(),
            "repair pass applied"
        );

        let mut summary = format!(
            "Repaired {} defect(s) with {} edit(s).",
            report.fixed.len(),
            report.edits.len()
        );
        if !report.residual.is_empty() {
            summary.push_str(&format!(
                "\n{} defect(s) need manual attention:\n{}",
                report.residual.len(),
                Self::report(&report.text, &report.residual).join("\n")
            ));
        }

        let data = &mut state.data;
        data.document = report.text;
        data.edits.extend(report.edits);
        data.defects = report.residual.clone();
        data.residual = report.residual;
        state
            .transcript
            .push(tag(Message::assistant(summary), EditPhase::Repair));
        Ok(())
    }
}

#[async_trait]
impl AgentProgram for EditAgent {
    type Phase = EditPhase;
    type Data = EditData;

    fn name(&self) -> &'static str {
        "edit"
    }

    fn table(&self) -> &PhaseTable<EditPhase, EditState> {
        &self.table
    }

    fn policy(&self) -> TurnPolicy {
        TurnPolicy::RunToRest {
            max_steps: self.max_steps,
        }
    }

    /// The utterance is the edit instruction. A fenced document in it
    /// replaces the current document when none was loaded.
    fn absorb(&self, state: &mut EditState, utterance: &str) {
        if state.phase != EditPhase::Analyze {
            return;
        }
        let mut instruction = utterance.trim();
        if state.data.document.is_empty() && utterance.contains("```") {
            state.data.document = extract_fenced_document(utterance);
            instruction = utterance.split("```").next().unwrap_or("").trim();
        }
        if !instruction.is_empty() {
            state.data.instruction = Some(instruction.to_string());
        }
    }

    async fn enter(
        &self,
        phase: EditPhase,
        state: &mut EditState,
        cx: &TurnContext<'_>,
    ) -> Result<()> {
        match phase {
            EditPhase::Analyze => self.analyze(state),
            EditPhase::Edit => self.edit(state, cx).await,
            EditPhase::Repair => self.repair(state),
            EditPhase::End => Ok(()),
        }
    }
}

fn tag(message: Message, phase: EditPhase) -> Message {
    message
        .with_metadata("agent", "edit")
        .with_metadata("phase", phase.to_string())
}
