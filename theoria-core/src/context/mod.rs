//! Conversation types shared by every agent.
//!
//! A [`Transcript`] is the append-only record of one session's turns. Agents
//! read it to build completion requests; nothing outside this module can
//! reorder or rewrite an entry once it has been pushed.

mod types;

pub use types::{Message, Role, Transcript};
