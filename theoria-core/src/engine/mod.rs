//! Generic phase-transition engine.
//!
//! An agent is a configuration of this engine, not a subtype of it: an
//! [`AgentProgram`] supplies a [`PhaseTable`], a [`TurnPolicy`], a signal
//! folding step and one entry action per phase. [`PhaseEngine::run_turn`]
//! drives one user turn:
//!
//! 1. a terminal current phase makes the turn a no-op
//! 2. the state is cloned and the user utterance appended to the clone
//! 3. [`AgentProgram::absorb`] folds signals from the utterance into the clone
//! 4. the current phase's entry action runs, then the table picks the next
//!    phase; under [`TurnPolicy::RunToRest`] this repeats for the successor
//! 5. the clone replaces the caller's state
//!
//! Any error in steps 3-4 leaves the caller's state exactly as it was, and so
//! does dropping the turn future.

mod table;

pub use table::{
    always, PhaseTable, PhaseTableBuilder, PhaseTag, Predicate, Transition, TurnPolicy,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Debug;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::context::{Message, Transcript};
use crate::error::{Error, Result};
use crate::llm::{CompletionRequest, CompletionResponse, LLMClient, StreamChunk};

/// Everything an agent knows about one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState<P, D> {
    pub phase: P,
    pub transcript: Transcript,
    /// Agent-specific accumulators read by the transition predicates
    pub data: D,
    /// Committed turns so far
    #[serde(default)]
    pub turns: u64,
}

impl<P, D: Default> AgentState<P, D> {
    pub fn new(phase: P) -> Self {
        Self {
            phase,
            transcript: Transcript::new(),
            data: D::default(),
            turns: 0,
        }
    }
}

impl<P, D> AgentState<P, D> {
    pub fn with_data(phase: P, data: D) -> Self {
        Self {
            phase,
            transcript: Transcript::new(),
            data,
            turns: 0,
        }
    }
}

/// State type driven by program `A`.
pub type StateOf<A> = AgentState<<A as AgentProgram>::Phase, <A as AgentProgram>::Data>;

/// Collaborators available to entry actions during one turn.
pub struct TurnContext<'a> {
    client: &'a dyn LLMClient,
    sink: Option<&'a mpsc::Sender<StreamChunk>>,
}

impl<'a> TurnContext<'a> {
    pub fn new(client: &'a dyn LLMClient) -> Self {
        Self { client, sink: None }
    }

    /// Forward completion increments to `sink` as they arrive.
    pub fn with_sink(mut self, sink: &'a mpsc::Sender<StreamChunk>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn client(&self) -> &'a dyn LLMClient {
        self.client
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    /// Run a completion, streaming it through the sink when one is set.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let Some(sink) = self.sink else {
            return self.client.complete(request).await;
        };

        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.client.provider().default_model().to_string());
        let mut stream = self.client.stream(request).await?;
        let mut content = String::new();
        let mut stop_reason = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            content.push_str(&chunk.content);
            if chunk.stop_reason.is_some() {
                stop_reason = chunk.stop_reason;
            }
            if sink.send(chunk).await.is_err() {
                debug!("stream receiver dropped, continuing without forwarding");
            }
        }

        let mut response = CompletionResponse::from_text(model, content);
        response.stop_reason = stop_reason.or(response.stop_reason);
        Ok(response)
    }

    /// Run a completion whose request carries a schema and extract its fields.
    ///
    /// Extraction happens only after the whole reply has arrived.
    pub async fn complete_structured(
        &self,
        request: CompletionRequest,
    ) -> Result<(CompletionResponse, Map<String, Value>)> {
        let phase = request.phase_or_default().to_string();
        let schema = request.schema.clone().ok_or_else(|| {
            Error::Internal(format!("phase '{phase}' requested extraction without a schema"))
        })?;
        let response = self.complete(request).await?;
        let fields = schema.extract(&phase, &response.content)?;
        Ok((response, fields))
    }
}

/// One agent expressed as a table plus actions.
#[async_trait]
pub trait AgentProgram: Send + Sync {
    type Phase: PhaseTag;
    type Data: Clone + Debug + Default + Send + Sync + Serialize + DeserializeOwned;

    /// Name used in logs and session records.
    fn name(&self) -> &'static str;

    fn table(&self) -> &PhaseTable<Self::Phase, AgentState<Self::Phase, Self::Data>>;

    fn policy(&self) -> TurnPolicy;

    /// Fold signals found in the user's utterance into `state`.
    fn absorb(&self, _state: &mut AgentState<Self::Phase, Self::Data>, _utterance: &str) {}

    /// Entry action of `phase`.
    async fn enter(
        &self,
        phase: Self::Phase,
        state: &mut AgentState<Self::Phase, Self::Data>,
        cx: &TurnContext<'_>,
    ) -> Result<()>;

    /// Fresh state positioned at the initial phase.
    fn initial_state(&self) -> AgentState<Self::Phase, Self::Data> {
        AgentState::new(self.table().initial())
    }
}

/// What one turn did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome<P> {
    pub from: P,
    pub to: P,
    /// Phases whose entry actions ran, in order
    pub visited: Vec<P>,
    /// Messages appended after the user's utterance
    pub messages: Vec<Message>,
}

impl<P: PartialEq> TurnOutcome<P> {
    /// The turn landed on a terminal phase without running anything.
    pub fn is_noop(&self) -> bool {
        self.visited.is_empty()
    }

    pub fn changed_phase(&self) -> bool {
        self.from != self.to
    }

    /// Last message the agent produced this turn.
    pub fn reply(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Drives an [`AgentProgram`] one user turn at a time.
pub struct PhaseEngine<A> {
    program: A,
}

impl<A: AgentProgram> PhaseEngine<A> {
    pub fn new(program: A) -> Self {
        Self { program }
    }

    pub fn program(&self) -> &A {
        &self.program
    }

    /// A fresh session state.
    pub fn start(&self) -> StateOf<A> {
        self.program.initial_state()
    }

    pub fn is_finished(&self, state: &StateOf<A>) -> bool {
        self.program.table().is_terminal(state.phase)
    }

    /// Run one user turn, committing to `state` only on success.
    #[instrument(
        skip(self, state, utterance, cx),
        fields(agent = self.program.name(), phase = %state.phase)
    )]
    pub async fn run_turn(
        &self,
        state: &mut StateOf<A>,
        utterance: &str,
        cx: &TurnContext<'_>,
    ) -> Result<TurnOutcome<A::Phase>> {
        let table = self.program.table();
        let from = state.phase;

        if table.is_terminal(from) {
            debug!("session is in a terminal phase, ignoring turn");
            return Ok(TurnOutcome {
                from,
                to: from,
                visited: Vec::new(),
                messages: Vec::new(),
            });
        }

        let mut working = state.clone();
        working.transcript.push(Message::user(utterance));
        let reply_start = working.transcript.len();
        self.program.absorb(&mut working, utterance);

        let mut visited = Vec::new();
        for _ in 0..self.program.policy().max_steps() {
            let phase = working.phase;
            visited.push(phase);
            self.program.enter(phase, &mut working, cx).await?;

            let next = match table.select(phase, &working) {
                Some(transition) => {
                    info!(
                        from = %phase,
                        to = %transition.target,
                        edge = transition.label,
                        "phase transition"
                    );
                    transition.target
                }
                None => phase,
            };
            working.phase = next;

            if next == phase || table.is_terminal(next) {
                break;
            }
        }

        working.turns += 1;
        let messages = working.transcript.messages()[reply_start..].to_vec();
        let to = working.phase;
        *state = working;

        Ok(TurnOutcome {
            from,
            to,
            visited,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransientKind;
    use crate::llm::mock::ScriptedClient;
    use std::fmt::Display;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    enum Step {
        Ask,
        Answer,
        Done,
    }

    impl Display for Step {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Notes {
        asked: u32,
        answered: bool,
        stop: bool,
    }

    type State = AgentState<Step, Notes>;

    fn asked_twice(s: &State) -> bool {
        s.data.asked >= 2
    }

    fn answered(s: &State) -> bool {
        s.data.answered
    }

    fn stop(s: &State) -> bool {
        s.data.stop
    }

    struct Quiz {
        table: PhaseTable<Step, State>,
        policy: TurnPolicy,
    }

    impl Quiz {
        fn new(policy: TurnPolicy) -> Self {
            let table = PhaseTable::builder(Step::Ask)
                .phase(Step::Ask)
                .phase(Step::Answer)
                .phase(Step::Done)
                .edge(Step::Ask, "stop", stop, Step::Done)
                .edge(Step::Ask, "asked twice", asked_twice, Step::Answer)
                .edge(Step::Answer, "answered", answered, Step::Done)
                .build()
                .unwrap();
            Self { table, policy }
        }
    }

    #[async_trait]
    impl AgentProgram for Quiz {
        type Phase = Step;
        type Data = Notes;

        fn name(&self) -> &'static str {
            "quiz"
        }

        fn table(&self) -> &PhaseTable<Step, State> {
            &self.table
        }

        fn policy(&self) -> TurnPolicy {
            self.policy
        }

        fn absorb(&self, state: &mut State, utterance: &str) {
            state.data.stop = utterance == "stop";
        }

        async fn enter(&self, phase: Step, state: &mut State, cx: &TurnContext<'_>) -> Result<()> {
            match phase {
                Step::Ask => {
                    let reply = cx
                        .complete(CompletionRequest::new().with_phase("ask"))
                        .await?;
                    state.transcript.push(Message::assistant(reply.content));
                    state.data.asked += 1;
                }
                Step::Answer => {
                    state.transcript.push(Message::assistant("answer"));
                    state.data.answered = true;
                }
                Step::Done => {}
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_single_step_advances_once_per_turn() {
        let client = ScriptedClient::new().reply("q1").reply("q2");
        let engine = PhaseEngine::new(Quiz::new(TurnPolicy::SingleStep));
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        let first = engine.run_turn(&mut state, "hi", &cx).await.unwrap();
        assert_eq!((first.from, first.to), (Step::Ask, Step::Ask));
        assert_eq!(first.reply().unwrap().content, "q1");

        let second = engine.run_turn(&mut state, "again", &cx).await.unwrap();
        assert_eq!(second.to, Step::Answer);
        assert_eq!(second.visited, vec![Step::Ask]);
        assert_eq!(state.turns, 2);
        assert_eq!(state.transcript.len(), 4);
    }

    #[tokio::test]
    async fn test_run_to_rest_follows_edges() {
        let client = ScriptedClient::new().reply("q1").reply("q2");
        let engine = PhaseEngine::new(Quiz::new(TurnPolicy::RunToRest { max_steps: 8 }));
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        // Ask self-loops after one question
        engine.run_turn(&mut state, "hi", &cx).await.unwrap();
        assert_eq!(state.phase, Step::Ask);

        let outcome = engine.run_turn(&mut state, "more", &cx).await.unwrap();
        assert_eq!(outcome.visited, vec![Step::Ask, Step::Answer]);
        assert_eq!(outcome.to, Step::Done);
        assert_eq!(outcome.messages.len(), 2);
        assert!(engine.is_finished(&state));
    }

    #[tokio::test]
    async fn test_terminal_phase_is_noop() {
        let client = ScriptedClient::new().reply("q1");
        let engine = PhaseEngine::new(Quiz::new(TurnPolicy::SingleStep));
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        engine.run_turn(&mut state, "stop", &cx).await.unwrap();
        assert_eq!(state.phase, Step::Done);
        let snapshot = state.clone();

        let outcome = engine.run_turn(&mut state, "anyone?", &cx).await.unwrap();
        assert!(outcome.is_noop());
        assert_eq!(state, snapshot);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_leaves_state_untouched() {
        let client = ScriptedClient::new()
            .reply("q1")
            .fail(Error::transient(TransientKind::Network, "reset"));
        let engine = PhaseEngine::new(Quiz::new(TurnPolicy::SingleStep));
        let cx = TurnContext::new(&client);
        let mut state = engine.start();

        engine.run_turn(&mut state, "hi", &cx).await.unwrap();
        let snapshot = state.clone();

        let err = engine.run_turn(&mut state, "again", &cx).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(state, snapshot);
    }

    #[tokio::test]
    async fn test_streaming_forwards_increments() {
        let client = ScriptedClient::new().reply("what is a thesis?");
        let engine = PhaseEngine::new(Quiz::new(TurnPolicy::SingleStep));
        let (tx, mut rx) = mpsc::channel(16);
        let cx = TurnContext::new(&client).with_sink(&tx);
        let mut state = engine.start();

        let outcome = engine.run_turn(&mut state, "hi", &cx).await.unwrap();
        drop(tx);

        let mut pieces = Vec::new();
        while let Some(chunk) = rx.recv().await {
            pieces.push(chunk.content);
        }
        assert_eq!(pieces[..4], ["what ", "is ", "a ", "thesis?"]);
        assert_eq!(pieces.concat(), "what is a thesis?");
        assert_eq!(outcome.reply().unwrap().content, "what is a thesis?");
    }

    #[test]
    fn test_state_serialization() {
        let mut state: State = AgentState::new(Step::Answer);
        state.transcript.push(Message::user("hi"));
        state.data.asked = 2;

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"phase\":\"Answer\""));
        let restored: State = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
