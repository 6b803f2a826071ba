//! Literature pipeline: search for sources, extract citation metadata,
//! validate it and format BibTeX entries.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::context::Message;
use crate::engine::{always, AgentProgram, AgentState, PhaseTable, TurnContext, TurnPolicy};
use crate::error::{Error, Result};
use crate::extraction::{ExtractionSchema, FieldSpec, FieldType};

use super::CompletionSettings;

const SYSTEM_PROMPT: &str = "You are Bibliographos, a scholarly research assistant specializing in \
literature search, citation management, and BibTeX generation.

Your responsibilities:
- Search for relevant academic sources based on user queries
- Extract citation metadata from sources
- Maintain citation traceability - every claim needs a source

Current phase: {phase}
- search: Find relevant academic sources
- extract: Extract citation metadata from found sources

Respond in the user's language. Be thorough but concise.";

/// Longest abstract carried into a BibTeX entry, in characters.
const MAX_ABSTRACT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteraturePhase {
    Search,
    Extract,
    Validate,
    End,
}

impl std::fmt::Display for LiteraturePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Search => write!(f, "search"),
            Self::Extract => write!(f, "extract"),
            Self::Validate => write!(f, "validate"),
            Self::End => write!(f, "end"),
        }
    }
}

/// A source proposed by the search phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<String>,
    /// Journal, conference or publisher
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub relevance: Option<String>,
}

/// Bibliographic metadata of one work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Author-year key, e.g. `smith2023`
    pub key: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "abstract")]
    pub abstract_text: Option<String>,
}

impl Citation {
    /// Required BibTeX fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.authors.iter().all(|a| a.trim().is_empty()) {
            missing.push("author");
        }
        if self.title.trim().is_empty() {
            missing.push("title");
        }
        if self.year.trim().is_empty() {
            missing.push("year");
        }
        missing
    }
}

/// Escape the characters BibTeX treats specially in field text.
fn escape_field(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev = None;
    for c in text.chars() {
        if matches!(c, '&' | '%' | '#') && prev != Some('\\') {
            out.push('\\');
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Render `citation` as a BibTeX entry.
pub fn format_bibtex(citation: &Citation) -> String {
    let mut fields = vec![
        format!(
            "author = {{{}}}",
            escape_field(&citation.authors.join(" and "))
        ),
        format!("title = {{{}}}", escape_field(&citation.title)),
        format!("year = {{{}}}", citation.year),
    ];
    if let Some(doi) = citation.doi.as_deref().filter(|d| !d.is_empty()) {
        fields.push(format!("doi = {{{doi}}}"));
    }
    if let Some(url) = citation.url.as_deref().filter(|u| !u.is_empty()) {
        fields.push(format!("url = {{{url}}}"));
    }
    if let Some(abstract_text) = citation.abstract_text.as_deref().filter(|a| !a.is_empty()) {
        let truncated: String = abstract_text.chars().take(MAX_ABSTRACT_CHARS).collect();
        fields.push(format!("abstract = {{{}}}", escape_field(&truncated)));
    }

    format!(
        "@{}{{{},\n  {}\n}}",
        citation.entry_type,
        citation.key,
        fields.join(",\n  ")
    )
}

/// Accumulators of one literature search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiteratureData {
    pub query: String,
    pub search_results: Vec<SearchResult>,
    pub citations: Vec<Citation>,
    pub bib_entries: Vec<String>,
    /// Citation keys that lacked required fields at validation
    pub incomplete: Vec<String>,
}

pub type LiteratureState = AgentState<LiteraturePhase, LiteratureData>;

fn results_recorded(state: &LiteratureState) -> bool {
    !state.data.search_results.is_empty()
}

fn citations_recorded(state: &LiteratureState) -> bool {
    !state.data.citations.is_empty()
}

fn search_schema() -> ExtractionSchema {
    ExtractionSchema::new("search_results").field(
        FieldSpec::new(
            "results",
            FieldType::list(FieldType::object(vec![
                FieldSpec::new("title", FieldType::String),
                FieldSpec::new("authors", FieldType::list(FieldType::String)),
                FieldSpec::new("year", FieldType::String).optional(),
                FieldSpec::new("source", FieldType::String)
                    .with_description("journal, conference or publisher")
                    .optional(),
                FieldSpec::new("doi", FieldType::String).optional(),
                FieldSpec::new("relevance", FieldType::String)
                    .with_description("one sentence on why the source matters")
                    .optional(),
            ])),
        )
        .with_description("Relevant academic sources, most relevant first"),
    )
}

fn citation_schema() -> ExtractionSchema {
    ExtractionSchema::new("citations").field(
        FieldSpec::new(
            "citations",
            FieldType::list(FieldType::object(vec![
                FieldSpec::new("key", FieldType::String)
                    .with_description("author-year key, e.g. smith2023"),
                FieldSpec::new(
                    "type",
                    FieldType::enum_of([
                        "article",
                        "book",
                        "inproceedings",
                        "incollection",
                        "phdthesis",
                        "techreport",
                        "misc",
                    ]),
                ),
                FieldSpec::new("title", FieldType::String),
                FieldSpec::new("authors", FieldType::list(FieldType::String))
                    .with_description("\"Last, First\" per author"),
                FieldSpec::new("year", FieldType::String),
                FieldSpec::new("source", FieldType::String).optional(),
                FieldSpec::new("doi", FieldType::String).optional(),
                FieldSpec::new("url", FieldType::String).optional(),
                FieldSpec::new("abstract", FieldType::String).optional(),
            ])),
        )
        .with_description("One entry per source from the search results"),
    )
}

/// Deserialize the list stored under `field` of extracted `fields`.
fn take_list<T: DeserializeOwned>(
    phase: LiteraturePhase,
    fields: &mut Map<String, Value>,
    field: &str,
) -> Result<Vec<T>> {
    let value = fields.remove(field).unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(value)
        .map_err(|e| Error::malformed_output(phase.to_string(), format!("{field}: {e}")))
}

/// Literature search agent.
pub struct LiteratureAgent {
    table: PhaseTable<LiteraturePhase, LiteratureState>,
    settings: CompletionSettings,
    max_steps: usize,
}

impl LiteratureAgent {
    pub fn new() -> Result<Self> {
        use LiteraturePhase::*;

        let table = PhaseTable::builder(Search)
            .phase(Search)
            .phase(Extract)
            .phase(Validate)
            .phase(End)
            .edge(Search, "results recorded", results_recorded, Extract)
            .edge(Extract, "citations recorded", citations_recorded, Validate)
            .edge(Validate, "validated", always, End)
            .build()?;

        Ok(Self {
            table,
            settings: CompletionSettings::default(),
            max_steps: 8,
        })
    }

    pub fn with_settings(mut self, settings: CompletionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    fn system_prompt(phase: LiteraturePhase) -> String {
        SYSTEM_PROMPT.replace("{phase}", &phase.to_string())
    }

    async fn search(&self, state: &mut LiteratureState, cx: &TurnContext<'_>) -> Result<()> {
        let phase = LiteraturePhase::Search;
        let instruction = format!(
            "Search query: {}\n\nProvide a list of relevant academic sources with title, \
             authors, year, source, DOI if available and a brief relevance explanation.",
            state.data.query
        );
        let mut messages = state.transcript.messages().to_vec();
        messages.push(Message::user(instruction));
        let request = self
            .settings
            .request(phase)
            .with_system(Self::system_prompt(phase))
            .with_messages(messages)
            .with_schema(search_schema());

        let (_, mut fields) = cx.complete_structured(request).await?;
        let results: Vec<SearchResult> = take_list(phase, &mut fields, "results")?;
        info!(query = %state.data.query, results = results.len(), "search results recorded");

        let summary = if results.is_empty() {
            format!(
                "No sources found for \"{}\". Try rephrasing the query.",
                state.data.query
            )
        } else {
            let lines: Vec<String> = results
                .iter()
                .enumerate()
                .map(|(i, r)| {
                    let year = r.year.as_deref().unwrap_or("n.d.");
                    let source = r
                        .source
                        .as_deref()
                        .map(|s| format!(". {s}"))
                        .unwrap_or_default();
                    format!(
                        "{}. {} ({year}), {}{source}",
                        i + 1,
                        r.title,
                        r.authors.join(", ")
                    )
                })
                .collect();
            format!("Found {} source(s):\n{}", results.len(), lines.join("\n"))
        };
        state.data.search_results = results;
        state.transcript.push(tag(Message::assistant(summary), phase));
        Ok(())
    }

    async fn extract(&self, state: &mut LiteratureState, cx: &TurnContext<'_>) -> Result<()> {
        let phase = LiteraturePhase::Extract;
        let listing = serde_json::to_string_pretty(&state.data.search_results)?;
        let instruction = format!(
            "Extract structured citation metadata for these search results:\n{listing}"
        );
        let mut messages = state.transcript.messages().to_vec();
        messages.push(Message::user(instruction));
        let request = self
            .settings
            .request(phase)
            .with_system(Self::system_prompt(phase))
            .with_messages(messages)
            .with_schema(citation_schema());

        let (_, mut fields) = cx.complete_structured(request).await?;
        let extracted: Vec<Citation> = take_list(phase, &mut fields, "citations")?;

        let mut seen: HashSet<String> = state
            .data
            .citations
            .iter()
            .map(|c| c.key.clone())
            .collect();
        let before = state.data.citations.len();
        for mut citation in extracted {
            let key = citation.key.trim().to_string();
            if key.is_empty() || !seen.insert(key.clone()) {
                debug!(key = %citation.key, "skipping citation with empty or duplicate key");
                continue;
            }
            citation.key = key;
            state.data.citations.push(citation);
        }
        let added = state.data.citations.len() - before;

        let keys: Vec<&str> = state.data.citations.iter().map(|c| c.key.as_str()).collect();
        let summary = format!("Extracted {added} citation(s): {}", keys.join(", "));
        state.transcript.push(tag(Message::assistant(summary), phase));
        Ok(())
    }

    /// Deterministic: checks completeness and formats every citation.
    fn validate(state: &mut LiteratureState) {
        let phase = LiteraturePhase::Validate;
        let data = &mut state.data;
        data.incomplete.clear();
        data.bib_entries = data.citations.iter().map(format_bibtex).collect();

        let mut notes = Vec::new();
        for citation in &data.citations {
            let missing = citation.missing_fields();
            if !missing.is_empty() {
                notes.push(format!("- {}: missing {}", citation.key, missing.join(", ")));
                data.incomplete.push(citation.key.clone());
            }
        }

        let mut summary = format!("```bibtex\n{}\n```", data.bib_entries.join("\n\n"));
        if !notes.is_empty() {
            summary.push_str("\n\nIncomplete entries:\n");
            summary.push_str(&notes.join("\n"));
        }
        state.transcript.push(tag(Message::assistant(summary), phase));
    }
}

#[async_trait]
impl AgentProgram for LiteratureAgent {
    type Phase = LiteraturePhase;
    type Data = LiteratureData;

    fn name(&self) -> &'static str {
        "literature"
    }

    fn table(&self) -> &PhaseTable<LiteraturePhase, LiteratureState> {
        &self.table
    }

    fn policy(&self) -> TurnPolicy {
        TurnPolicy::RunToRest {
            max_steps: self.max_steps,
        }
    }

    fn absorb(&self, state: &mut LiteratureState, utterance: &str) {
        let query = utterance.trim();
        if state.phase == LiteraturePhase::Search && !query.is_empty() {
            state.data.query = query.to_string();
        }
    }

    async fn enter(
        &self,
        phase: LiteraturePhase,
        state: &mut LiteratureState,
        cx: &TurnContext<'_>,
    ) -> Result<()> {
        match phase {
            LiteraturePhase::Search => self.search(state, cx).await,
            LiteraturePhase::Extract => self.extract(state, cx).await,
            LiteraturePhase::Validate => {
                Self::validate(state);
                Ok(())
            }
            LiteraturePhase::End => Ok(()),
        }
    }
}

fn tag(message: Message, phase: LiteraturePhase) -> Message {
    message
        .with_metadata("agent", "literature")
        .with_metadata("phase", phase.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PhaseEngine;
    use crate::llm::mock::ScriptedClient;
    use pretty_assertions::assert_eq;

    const SEARCH_REPLY: &str = r#"Here is what I found:
```json
{"results": [
  {"title": "Language and Thought", "authors": ["Smith, Jane"], "year": "2023", "source": "Mind"},
  {"title": "Linguistic Relativity", "authors": ["Doe, John"], "year": "2019"}
]}
```"#;

    const CITATION_REPLY: &str = r#"```json
{"citations": [
  {"key": "smith2023", "type": "article", "title": "Language and Thought",
   "authors": ["Smith, Jane"], "year": "2023", "source": "Mind", "doi": "10.1/x"},
  {"key": "smith2023", "type": "article", "title": "Duplicate",
   "authors": ["Smith, Jane"], "year": "2023"},
  {"key": "doe2019", "type": "book", "title": "Linguistic Relativity",
   "authors": ["Doe, John"], "year": ""}
]}
```"#;

    fn citation() -> Citation {
        Citation {
            key: "smith2023".into(),
            entry_type: "article".into(),
            title: "Sense & Reference".into(),
            authors: vec!["Smith, Jane".into(), "Roe, Richard".into()],
            year: "2023".into(),
            source: "Mind".into(),
            doi: Some("10.1000/xyz".into()),
            url: None,
            abstract_text: None,
        }
    }

    #[test]
    fn test_format_bibtex() {
        assert_eq!(
            format_bibtex(&citation()),
            "@article{smith2023,\n  author = {Smith, Jane and Roe, Richard},\n  title = {Sense \\& Reference},\n  year = {2023},\n  doi = {10.1000/xyz}\n}"
        );
    }

    #[test]
    fn test_format_bibtex_truncates_abstract() {
        let mut c = citation();
        c.doi = None;
        c.abstract_text = Some("x".repeat(600));
        let entry = format_bibtex(&c);
        assert!(entry.contains(&format!("abstract = {{{}}}", "x".repeat(500))));
        assert!(!entry.contains(&"x".repeat(501)));
    }

    #[test]
    fn test_escape_keeps_existing_escapes() {
        assert_eq!(escape_field("A \\& B & C 100%"), "A \\& B \\& C 100\\%");
    }

    #[test]
    fn test_missing_fields() {
        let mut c = citation();
        c.year = " ".into();
        c.authors.clear();
        assert_eq!(c.missing_fields(), vec!["author", "year"]);
    }

    #[tokio::test]
    async fn test_pipeline_runs_to_end_in_one_turn() {
        let client = ScriptedClient::new().reply(SEARCH_REPLY).reply(CITATION_REPLY);
        let engine = PhaseEngine::new(LiteratureAgent::new().unwrap());
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        let outcome = engine
            .run_turn(&mut state, "linguistic relativity", &cx)
            .await
            .unwrap();

        assert_eq!(
            outcome.visited,
            vec![
                LiteraturePhase::Search,
                LiteraturePhase::Extract,
                LiteraturePhase::Validate
            ]
        );
        assert_eq!(state.phase, LiteraturePhase::End);
        assert_eq!(state.data.query, "linguistic relativity");
        assert_eq!(state.data.search_results.len(), 2);
        let keys: Vec<&str> = state.data.citations.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["smith2023", "doe2019"]);
        assert_eq!(state.data.bib_entries.len(), 2);
        assert_eq!(state.data.incomplete, vec!["doe2019".to_string()]);
        assert!(outcome
            .reply()
            .unwrap()
            .content
            .starts_with("```bibtex\n@article{smith2023,"));

        let search_request = &client.requests()[0];
        assert!(search_request.schema.is_some());
        assert!(search_request
            .messages
            .last()
            .unwrap()
            .content
            .starts_with("Search query: linguistic relativity"));
    }

    #[tokio::test]
    async fn test_citation_keys_are_trimmed() {
        let citations = r#"{"citations": [
  {"key": "  lee2020 ", "type": "article", "title": "Padded", "authors": ["Lee, Ann"], "year": "2020"},
  {"key": "lee2020", "type": "article", "title": "Same key", "authors": ["Lee, Ann"], "year": "2020"},
  {"key": "   ", "type": "misc", "title": "No key", "authors": [], "year": ""}
]}"#;
        let client = ScriptedClient::new().reply(SEARCH_REPLY).reply(citations);
        let engine = PhaseEngine::new(LiteratureAgent::new().unwrap());
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        engine.run_turn(&mut state, "padding", &cx).await.unwrap();

        assert_eq!(state.data.citations.len(), 1);
        assert_eq!(state.data.citations[0].key, "lee2020");
        assert_eq!(state.data.citations[0].title, "Padded");
        assert!(state.data.bib_entries[0].starts_with("@article{lee2020,\n"));
    }

    #[tokio::test]
    async fn test_empty_results_stay_in_search() {
        let client = ScriptedClient::new().reply(r#"{"results": []}"#);
        let engine = PhaseEngine::new(LiteratureAgent::new().unwrap());
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        let outcome = engine.run_turn(&mut state, "nothing", &cx).await.unwrap();
        assert_eq!(state.phase, LiteraturePhase::Search);
        assert!(outcome.reply().unwrap().content.starts_with("No sources found"));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_citations_leave_state_untouched() {
        let client = ScriptedClient::new()
            .reply(SEARCH_REPLY)
            .reply("I could not find any metadata, sorry.");
        let engine = PhaseEngine::new(LiteratureAgent::new().unwrap());
        let cx = TurnContext::new(&client);
        let mut state = engine.start();
        let before = state.clone();

        let err = engine
            .run_turn(&mut state, "relativity", &cx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedOutput { ref phase, .. } if phase == "extract"));
        assert_eq!(state, before);
    }
}
