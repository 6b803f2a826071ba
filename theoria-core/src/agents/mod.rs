//! Agent variants built on the [`crate::engine`] phase engine.
//!
//! - [`DialecticAgent`]: clarify, challenge and synthesize a thesis
//! - [`LiteratureAgent`]: search, extract citations, format BibTeX
//! - [`EditAgent`]: analyze a LaTeX document, edit it, repair its structure
//!
//! [`Orchestrator`] routes turns between the dialogue and the literature
//! pipeline.

mod dialectic;
mod edit;
mod literature;
mod orchestrator;

pub use dialectic::{
    DialecticAgent, DialogueData, DialoguePhase, DialogueSignals, DialogueState,
    DEFAULT_OBJECTION_THRESHOLD,
};
pub use edit::{EditAgent, EditData, EditPhase, EditState};
pub use literature::{
    format_bibtex, Citation, LiteratureAgent, LiteratureData, LiteraturePhase, LiteratureState,
    SearchResult,
};
pub use orchestrator::{detect_handoff, Orchestrator, OrchestratorState, Route, RoutedTurn};

use serde::{Deserialize, Serialize};

use crate::llm::CompletionRequest;

/// Model parameters shared by every completion an agent issues.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionSettings {
    /// Overrides the client's default model
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl CompletionSettings {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// A request tagged with `phase` carrying these settings.
    pub fn request(&self, phase: impl std::fmt::Display) -> CompletionRequest {
        let mut request = CompletionRequest::new().with_phase(phase.to_string());
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_settings() {
        let settings = CompletionSettings::default()
            .with_model("gpt-4o-mini")
            .with_temperature(0.2)
            .with_max_tokens(512);
        let request = settings.request(DialoguePhase::Challenge);
        assert_eq!(request.phase.as_deref(), Some("challenge"));
        assert_eq!(request.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(512));
    }

    #[test]
    fn test_default_settings_leave_request_bare() {
        let request = CompletionSettings::default().request("search");
        assert!(request.model.is_none());
        assert!(request.temperature.is_none());
        assert!(request.max_tokens.is_none());
    }
}
