//! Routing between the dialogue and the literature pipeline.
//!
//! A turn asking for evidence, papers or sources is handed to the literature
//! pipeline. Its BibTeX output is held as pending sources and attached to the
//! next dialogue turn. Successive searches continue one literature session,
//! so only entries for newly seen citation keys become pending.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::context::{Message, Transcript};
use crate::engine::{PhaseEngine, TurnContext};
use crate::error::Result;

use super::dialectic::{DialecticAgent, DialogueState};
use super::literature::{LiteratureAgent, LiteraturePhase, LiteratureState};

/// Longest query handed to the literature pipeline, in characters.
const MAX_QUERY_CHARS: usize = 200;

const HANDOFF_PATTERNS: &[&str] = &[
    r"この主張の根拠を(探して|調べて|検索して)",
    r"(文献|論文|ソース|出典)を(探して|調べて|検索して)",
    r"(?i)(evidence|sources?|citations?|references?)\s+(for|about|on)",
    r"(?i)find\s+(papers?|sources?|evidence|literature)",
    r"(?i)search\s+(for\s+)?(literature|papers?|sources?)",
];

fn handoff_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        HANDOFF_PATTERNS
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The literature query requested by `message`, if it asks for sources.
///
/// The query is the text after the matched phrase, or the start of the
/// message when nothing follows it.
pub fn detect_handoff(message: &str) -> Option<String> {
    let found = handoff_patterns().iter().find_map(|p| p.find(message))?;
    let after = message[found.end()..].trim();
    let query = if after.is_empty() {
        truncate_chars(message.trim(), MAX_QUERY_CHARS)
    } else {
        truncate_chars(after, MAX_QUERY_CHARS)
    };
    Some(query.to_string())
}

/// Where a turn was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    Dialogue,
    Literature { query: String },
}

/// State of one orchestrated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub dialogue: DialogueState,
    /// Most recent literature run
    #[serde(default)]
    pub last_search: Option<LiteratureState>,
    /// BibTeX entries not yet shown to the dialogue
    #[serde(default)]
    pub pending_sources: Vec<String>,
    /// Combined conversation as the user saw it
    #[serde(default)]
    pub transcript: Transcript,
}

/// Result of one routed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedTurn {
    pub route: Route,
    /// Messages appended to the combined transcript after the user's
    pub messages: Vec<Message>,
}

impl RoutedTurn {
    pub fn reply(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Routes turns between the dialectic agent and the literature pipeline.
pub struct Orchestrator {
    dialogue: PhaseEngine<DialecticAgent>,
    literature: PhaseEngine<LiteratureAgent>,
}

impl Orchestrator {
    pub fn new(dialogue: DialecticAgent, literature: LiteratureAgent) -> Self {
        Self {
            dialogue: PhaseEngine::new(dialogue),
            literature: PhaseEngine::new(literature),
        }
    }

    /// An orchestrator with default agents.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(DialecticAgent::new()?, LiteratureAgent::new()?))
    }

    pub fn start(&self) -> OrchestratorState {
        OrchestratorState {
            dialogue: self.dialogue.start(),
            last_search: None,
            pending_sources: Vec::new(),
            transcript: Transcript::new(),
        }
    }

    pub fn route(&self, message: &str) -> Route {
        match detect_handoff(message) {
            Some(query) => Route::Literature { query },
            None => Route::Dialogue,
        }
    }

    /// Run one user turn. `state` changes only when the whole turn succeeds.
    #[instrument(skip_all)]
    pub async fn run_turn(
        &self,
        state: &mut OrchestratorState,
        utterance: &str,
        cx: &TurnContext<'_>,
    ) -> Result<RoutedTurn> {
        let route = self.route(utterance);
        let mut working = state.clone();
        working.transcript.push(Message::user(utterance));
        let reply_start = working.transcript.len();

        match &route {
            Route::Literature { query } => {
                info!(query = %query, "handing off to literature search");
                let mut search = match working.last_search.take() {
                    Some(mut previous) => {
                        previous.phase = LiteraturePhase::Search;
                        previous
                    }
                    None => self.literature.start(),
                };
                let known = search.data.bib_entries.len();
                self.literature.run_turn(&mut search, query, cx).await?;

                let fresh = search.data.bib_entries.get(known..).unwrap_or_default();
                let found = fresh.len();
                if found > 0 {
                    working.pending_sources.extend(fresh.iter().cloned());
                    working.transcript.push(
                        Message::assistant(format!(
                            "[Literature search found {found} relevant source(s). \
                             The sources have been integrated into the discussion context.]"
                        ))
                        .with_metadata("agent", "orchestrator"),
                    );
                } else if let Some(last) = search.transcript.last_assistant_message() {
                    working.transcript.push(last.clone());
                }
                working.last_search = Some(search);
            }
            Route::Dialogue => {
                let mut input = utterance.to_string();
                if !working.pending_sources.is_empty() {
                    input.push_str("\n\n[Available sources from literature search]:\n");
                    input.push_str(&working.pending_sources.join("\n"));
                    working.pending_sources.clear();
                }
                let outcome = self
                    .dialogue
                    .run_turn(&mut working.dialogue, &input, cx)
                    .await?;
                for message in outcome.messages {
                    working.transcript.push(message);
                }
            }
        }

        let messages = working.transcript.messages()[reply_start..].to_vec();
        *state = working;
        Ok(RoutedTurn { route, messages })
    }
}
