//! # theoria-core
//!
//! Phase-driven research dialogue agents with deterministic LaTeX structure
//! repair.
//!
//! ## Core Components
//!
//! - **LaTeX**: structural scan, defect classification and repair, with no
//!   model involved
//! - **Engine**: generic phase-transition driver; agents are tables plus
//!   entry actions
//! - **Agents**: dialectic dialogue, literature pipeline, LaTeX edit loop and
//!   the orchestrator routing between dialogue and literature search
//! - **LLM**: completion capability over OpenAI-compatible endpoints with
//!   retry and streaming
//! - **Session**: SQLite persistence of agent states
//!
//! ## Example
//!
//! ```rust,ignore
//! use theoria_core::{ConfigLoader, OpenAIClient, PhaseEngine, RetryingClient, TurnContext};
//!
//! let config = ConfigLoader::new().load()?;
//! let client = RetryingClient::new(OpenAIClient::new(config.client_config()?)?)
//!     .with_policy(config.retry.clone());
//!
//! let engine = PhaseEngine::new(config.dialectic_agent()?);
//! let mut state = engine.start();
//! let outcome = engine
//!     .run_turn(&mut state, "thesis: Language shapes thought", &TurnContext::new(&client))
//!     .await?;
//! println!("{}", outcome.reply().map(|m| m.content.as_str()).unwrap_or_default());
//! ```

pub mod agents;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod latex;
pub mod llm;
pub mod session;

// Re-exports for convenience
pub use agents::{
    CompletionSettings, DialecticAgent, DialoguePhase, DialogueState, EditAgent, EditPhase,
    EditState, LiteratureAgent, LiteraturePhase, LiteratureState, Orchestrator,
    OrchestratorState, Route, RoutedTurn,
};
pub use config::{init_project_config, ConfigLoader, TheoriaConfig};
pub use context::{Message, Role, Transcript};
pub use engine::{
    AgentProgram, AgentState, PhaseEngine, PhaseTable, TurnContext, TurnOutcome, TurnPolicy,
};
pub use error::{Error, Result, TransientKind};
pub use extraction::{ExtractionSchema, FieldSpec, FieldType};
pub use latex::{
    analyze, repair_document, Analysis, AnalysisOptions, Defect, DefectKind, EditOperation,
    RepairReport,
};
pub use llm::{
    ClientConfig, CompletionRequest, CompletionResponse, LLMClient, OpenAIClient, Provider,
    RetryPolicy, RetryingClient, StreamChunk,
};
pub use session::{SessionKind, SessionRecord, SessionStore, SqliteSessionStore};
