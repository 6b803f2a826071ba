//! Socratic dialogue agent: clarify a thesis, challenge it, synthesize.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::Message;
use crate::engine::{AgentProgram, AgentState, PhaseTable, TurnContext, TurnPolicy};
use crate::error::Result;

use super::CompletionSettings;

/// Objections gathered before the dialogue moves on to synthesis.
pub const DEFAULT_OBJECTION_THRESHOLD: usize = 3;

const SYSTEM_PROMPT: &str = "You are Theoretikos, a Socratic philosophical dialogue partner.

Your role:
- Help the user clarify, examine, and refine their arguments
- Ask probing questions to uncover assumptions
- Present counter-arguments and objections
- Never simply agree; always push for deeper thinking
- Guide toward well-supported conclusions with traceable reasoning

Current phase: {phase}
- clarify: Help user articulate their thesis clearly
- challenge: Present objections and counter-arguments
- synthesize: Help integrate insights into refined position

Respond in the user's language. Be rigorous but not hostile.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialoguePhase {
    Clarify,
    Challenge,
    Synthesize,
    End,
}

impl std::fmt::Display for DialoguePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clarify => write!(f, "clarify"),
            Self::Challenge => write!(f, "challenge"),
            Self::Synthesize => write!(f, "synthesize"),
            Self::End => write!(f, "end"),
        }
    }
}

/// Signals found in the latest user utterance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueSignals {
    /// The user typed `/end`
    pub end: bool,
    /// The user opened a new topic with `new topic:`
    pub new_topic: bool,
}

/// Accumulators of one dialogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueData {
    pub thesis: Option<String>,
    pub objections: Vec<String>,
    pub refinements: Vec<String>,
    /// Theses closed by a topic change, oldest first
    pub previous_theses: Vec<String>,
    pub objection_threshold: usize,
    pub signals: DialogueSignals,
}

impl Default for DialogueData {
    fn default() -> Self {
        Self {
            thesis: None,
            objections: Vec::new(),
            refinements: Vec::new(),
            previous_theses: Vec::new(),
            objection_threshold: DEFAULT_OBJECTION_THRESHOLD,
            signals: DialogueSignals::default(),
        }
    }
}

pub type DialogueState = AgentState<DialoguePhase, DialogueData>;

fn end_requested(state: &DialogueState) -> bool {
    state.data.signals.end
}

fn thesis_recorded(state: &DialogueState) -> bool {
    state.data.thesis.is_some()
}

fn objections_reached(state: &DialogueState) -> bool {
    state.data.objections.len() >= state.data.objection_threshold
}

fn new_topic(state: &DialogueState) -> bool {
    state.data.signals.new_topic
}

/// Text following `marker` (ASCII, case-insensitive), trimmed; `None` when the
/// marker is absent or nothing follows it.
pub(crate) fn after_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find(marker)? + marker.len();
    let rest = text[start..].trim();
    (!rest.is_empty()).then_some(rest)
}

fn is_end_command(utterance: &str) -> bool {
    utterance.trim().eq_ignore_ascii_case("/end")
}

/// Dialectical dialogue agent.
pub struct DialecticAgent {
    table: PhaseTable<DialoguePhase, DialogueState>,
    settings: CompletionSettings,
    objection_threshold: usize,
}

impl DialecticAgent {
    pub fn new() -> Result<Self> {
        use DialoguePhase::*;

        let table = PhaseTable::builder(Clarify)
            .phase(Clarify)
            .phase(Challenge)
            .phase(Synthesize)
            .phase(End)
            .edge(Clarify, "end requested", end_requested, End)
            .edge(Clarify, "thesis recorded", thesis_recorded, Challenge)
            .edge(Challenge, "end requested", end_requested, End)
            .edge(Challenge, "objections reached", objections_reached, Synthesize)
            .edge(Synthesize, "end requested", end_requested, End)
            .edge(Synthesize, "new topic", new_topic, Clarify)
            .build()?;

        Ok(Self {
            table,
            settings: CompletionSettings::default(),
            objection_threshold: DEFAULT_OBJECTION_THRESHOLD,
        })
    }

    pub fn with_settings(mut self, settings: CompletionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_objection_threshold(mut self, threshold: usize) -> Self {
        self.objection_threshold = threshold.max(1);
        self
    }

    fn system_prompt(phase: DialoguePhase) -> String {
        SYSTEM_PROMPT.replace("{phase}", &phase.to_string())
    }

    fn closing_summary(data: &DialogueData) -> String {
        let mut summary = String::from("Dialogue closed.");
        if let Some(thesis) = &data.thesis {
            summary.push_str(&format!("\nThesis: {thesis}"));
        }
        summary.push_str(&format!(
            "\nObjections raised: {}\nRefinements: {}",
            data.objections.len(),
            data.refinements.len()
        ));
        summary
    }

    async fn reply(
        &self,
        phase: DialoguePhase,
        state: &DialogueState,
        instruction: Option<String>,
        cx: &TurnContext<'_>,
    ) -> Result<String> {
        let mut messages = state.transcript.messages().to_vec();
        if let Some(instruction) = instruction {
            messages.push(Message::user(instruction));
        }
        let request = self
            .settings
            .request(phase)
            .with_system(Self::system_prompt(phase))
            .with_messages(messages);
        Ok(cx.complete(request).await?.content)
    }
}

#[async_trait]
impl AgentProgram for DialecticAgent {
    type Phase = DialoguePhase;
    type Data = DialogueData;

    fn name(&self) -> &'static str {
        "dialectic"
    }

    fn table(&self) -> &PhaseTable<DialoguePhase, DialogueState> {
        &self.table
    }

    fn policy(&self) -> TurnPolicy {
        TurnPolicy::SingleStep
    }

    fn initial_state(&self) -> DialogueState {
        let mut state = DialogueState::new(DialoguePhase::Clarify);
        state.data.objection_threshold = self.objection_threshold;
        state
    }

    fn absorb(&self, state: &mut DialogueState, utterance: &str) {
        let data = &mut state.data;
        data.signals = DialogueSignals {
            end: is_end_command(utterance),
            new_topic: false,
        };

        if state.phase == DialoguePhase::Synthesize
            && after_marker(utterance, "new topic:").is_some()
        {
            data.signals.new_topic = true;
            if let Some(previous) = data.thesis.take() {
                data.previous_theses.push(previous);
            }
            data.objections.clear();
            debug!("new topic opened, thesis archived");
        }

        if data.thesis.is_none() {
            if let Some(thesis) = after_marker(utterance, "thesis:") {
                debug!(thesis, "thesis recorded");
                data.thesis = Some(thesis.to_string());
            }
        }
    }

    async fn enter(
        &self,
        phase: DialoguePhase,
        state: &mut DialogueState,
        cx: &TurnContext<'_>,
    ) -> Result<()> {
        if state.data.signals.end {
            let summary = Self::closing_summary(&state.data);
            state.transcript.push(tag(Message::assistant(summary), phase));
            return Ok(());
        }

        match phase {
            DialoguePhase::Clarify => {
                let reply = self.reply(phase, state, None, cx).await?;
                state.transcript.push(tag(Message::assistant(reply), phase));
            }
            DialoguePhase::Challenge => {
                let thesis = state.data.thesis.as_deref().unwrap_or("(not yet stated)");
                let instruction = format!(
                    "The user's thesis: {thesis}\n\nPresent a thoughtful objection or counter-argument."
                );
                let reply = self.reply(phase, state, Some(instruction), cx).await?;
                state.data.objections.push(reply.clone());
                state.transcript.push(tag(Message::assistant(reply), phase));
            }
            DialoguePhase::Synthesize if state.data.signals.new_topic => {
                let previous = state
                    .data
                    .previous_theses
                    .last()
                    .map(String::as_str)
                    .unwrap_or("the previous thesis");
                let instruction = format!(
                    "The user wants to move on to a new topic. Briefly close the discussion of \
                     \"{previous}\" and invite them to state their new thesis."
                );
                let reply = self.reply(phase, state, Some(instruction), cx).await?;
                state.transcript.push(tag(Message::assistant(reply), phase));
            }
            DialoguePhase::Synthesize => {
                let thesis = state.data.thesis.as_deref().unwrap_or("(not yet stated)");
                let instruction = format!(
                    "Original thesis: {thesis}\nObjections raised: {}\n\n\
                     Help the user synthesize insights into a refined position.",
                    state.data.objections.len()
                );
                let reply = self.reply(phase, state, Some(instruction), cx).await?;
                state.data.refinements.push(reply.clone());
                state.transcript.push(tag(Message::assistant(reply), phase));
            }
            DialoguePhase::End => {}
        }
        Ok(())
    }
}

fn tag(message: Message, phase: DialoguePhase) -> Message {
    message
        .with_metadata("agent", "dialectic")
        .with_metadata("phase", phase.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PhaseEngine;
    use crate::llm::mock::ScriptedClient;

    fn engine() -> PhaseEngine<DialecticAgent> {
        PhaseEngine::new(DialecticAgent::new().unwrap())
    }

    #[test]
    fn test_after_marker() {
        assert_eq!(
            after_marker("My THESIS: Language shapes thought", "thesis:"),
            Some("Language shapes thought")
        );
        assert_eq!(after_marker("thesis:   ", "thesis:"), None);
        assert_eq!(after_marker("no marker", "thesis:"), None);
        // Non-ASCII text before the marker keeps byte offsets aligned
        assert_eq!(after_marker("Über thesis: ja", "thesis:"), Some("ja"));
    }

    #[tokio::test]
    async fn test_scenario_clarify_until_thesis() {
        let client = ScriptedClient::new()
            .reply("What do you mean by shaping?")
            .reply("Understood. Let us examine it.")
            .reply("Objection: bilinguals think the same thoughts.");
        let engine = engine();
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        engine
            .run_turn(&mut state, "I think language matters", &cx)
            .await
            .unwrap();
        assert_eq!(state.phase, DialoguePhase::Clarify);
        assert!(state.data.thesis.is_none());

        let outcome = engine
            .run_turn(&mut state, "thesis: Language shapes thought", &cx)
            .await
            .unwrap();
        assert_eq!(outcome.from, DialoguePhase::Clarify);
        assert_eq!(state.phase, DialoguePhase::Challenge);
        assert_eq!(state.data.thesis.as_deref(), Some("Language shapes thought"));

        engine.run_turn(&mut state, "Go on", &cx).await.unwrap();
        assert_eq!(state.data.objections.len(), 1);
        let request = &client.requests()[2];
        assert!(request
            .messages
            .last()
            .unwrap()
            .content
            .contains("The user's thesis: Language shapes thought"));
        assert_eq!(request.phase.as_deref(), Some("challenge"));
    }

    #[tokio::test]
    async fn test_challenge_moves_to_synthesis_at_threshold() {
        let client = ScriptedClient::new()
            .reply("objection one")
            .reply("objection two")
            .reply("synthesis");
        let engine = PhaseEngine::new(DialecticAgent::new().unwrap().with_objection_threshold(2));
        let cx = TurnContext::new(&client);
        let mut state = engine.start();
        state.phase = DialoguePhase::Challenge;
        state.data.thesis = Some("Virtue is knowledge".into());

        engine.run_turn(&mut state, "hmm", &cx).await.unwrap();
        assert_eq!(state.phase, DialoguePhase::Challenge);
        engine.run_turn(&mut state, "and?", &cx).await.unwrap();
        assert_eq!(state.phase, DialoguePhase::Synthesize);

        engine.run_turn(&mut state, "so?", &cx).await.unwrap();
        assert_eq!(state.phase, DialoguePhase::Synthesize);
        assert_eq!(state.data.refinements, vec!["synthesis".to_string()]);
    }

    #[tokio::test]
    async fn test_new_topic_returns_to_clarify() {
        let client = ScriptedClient::new().reply("Closing that thread. What next?");
        let engine = engine();
        let cx = TurnContext::new(&client);
        let mut state = engine.start();
        state.phase = DialoguePhase::Synthesize;
        state.data.thesis = Some("Old thesis".into());
        state.data.objections = vec!["a".into(), "b".into(), "c".into()];

        engine
            .run_turn(&mut state, "new topic: free will", &cx)
            .await
            .unwrap();
        assert_eq!(state.phase, DialoguePhase::Clarify);
        assert!(state.data.thesis.is_none());
        assert!(state.data.objections.is_empty());
        assert_eq!(state.data.previous_theses, vec!["Old thesis".to_string()]);
        assert!(state.data.refinements.is_empty());
    }

    #[tokio::test]
    async fn test_end_command_closes_without_completion() {
        let client = ScriptedClient::new();
        let engine = engine();
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        let outcome = engine.run_turn(&mut state, " /END ", &cx).await.unwrap();
        assert_eq!(outcome.to, DialoguePhase::End);
        assert!(outcome.reply().unwrap().content.starts_with("Dialogue closed."));
        assert_eq!(client.calls(), 0);

        let after = engine.run_turn(&mut state, "hello?", &cx).await.unwrap();
        assert!(after.is_noop());
    }

    #[test]
    fn test_state_round_trip() {
        let mut state = DialecticAgent::new().unwrap().initial_state();
        state.data.thesis = Some("t".into());
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["phase"], "clarify");
        let restored: DialogueState = serde_json::from_value(json).unwrap();
        assert_eq!(restored, state);
    }
}
