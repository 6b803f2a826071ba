//! Session persistence.
//!
//! A [`SessionRecord`] holds one agent state as opaque JSON together with the
//! metadata needed to list sessions. Stores only move records; turning a
//! state into a record and back is [`SessionRecord::capture`] and
//! [`SessionRecord::restore`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use theoria_core::session::{SessionKind, SessionRecord, SessionStore, SqliteSessionStore};
//!
//! let store = SqliteSessionStore::open("sessions.db")?;
//! let record = SessionRecord::capture(SessionKind::Chat, &state)?;
//! store.save(&record)?;
//!
//! let restored: DialogueState = store.load(&record.id)?.unwrap().restore()?;
//! ```

mod schema;
mod store;

pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::SqliteSessionStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agents::OrchestratorState;
use crate::context::Transcript;
use crate::engine::AgentState;
use crate::error::{Error, Result};

/// Title used when a session has no user message yet.
pub const UNTITLED: &str = "Untitled Session";

const TITLE_CHARS: usize = 50;

/// Fresh session id: `ses_` followed by 12 hex digits.
pub fn generate_session_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("ses_{}", &hex[..12])
}

/// Which agent a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Dialectic dialogue
    Chat,
    /// Literature pipeline
    Search,
    /// Dialogue with literature handoff
    Research,
    /// LaTeX edit loop
    Edit,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Search => "search",
            Self::Research => "research",
            Self::Edit => "edit",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(Self::Chat),
            "search" => Ok(Self::Search),
            "research" => Ok(Self::Research),
            "edit" => Ok(Self::Edit),
            other => Err(Error::Storage(format!("unknown session kind '{other}'"))),
        }
    }
}

/// A state that can be persisted as a session.
pub trait SessionState: Serialize + DeserializeOwned {
    /// The conversation the session title is derived from.
    fn transcript(&self) -> &Transcript;
}

impl<P, D> SessionState for AgentState<P, D>
where
    P: Serialize + DeserializeOwned,
    D: Serialize + DeserializeOwned,
{
    fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

impl SessionState for OrchestratorState {
    fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

/// First user message cut to 50 characters, or [`UNTITLED`].
pub fn derive_title(transcript: &Transcript) -> String {
    let Some(message) = transcript.first_user_message() else {
        return UNTITLED.to_string();
    };
    let content = message.content.trim();
    if content.is_empty() {
        return UNTITLED.to_string();
    }
    let mut title: String = content.chars().take(TITLE_CHARS).collect();
    if content.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

/// One persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub kind: SessionKind,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Serialized agent state
    pub state_json: String,
}

impl SessionRecord {
    /// A new record with a fresh id holding `state`.
    pub fn capture<S: SessionState>(kind: SessionKind, state: &S) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: generate_session_id(),
            kind,
            title: derive_title(state.transcript()),
            created_at: now,
            updated_at: now,
            state_json: serde_json::to_string(state)?,
        })
    }

    /// Replace the stored state, refreshing title and update time.
    pub fn update<S: SessionState>(&mut self, state: &S) -> Result<()> {
        self.state_json = serde_json::to_string(state)?;
        self.title = derive_title(state.transcript());
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Deserialize the stored state.
    pub fn restore<S: SessionState>(&self) -> Result<S> {
        Ok(serde_json::from_str(&self.state_json)?)
    }
}

/// Listing entry without the state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub kind: SessionKind,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for session records.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<SessionRecord>>;

    /// Insert or replace the whole record.
    fn save(&self, record: &SessionRecord) -> Result<()>;

    /// Whether a record was removed.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Most recently updated first.
    fn list(&self, limit: usize) -> Result<Vec<SessionSummary>>;
}
