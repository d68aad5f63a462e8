// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! The conversation orchestrator. One turn walks
//! generate -> validate -> execute -> parse, with two independently
//! bounded retry edges back to generation: one for generation and
//! validation failures, one for execution and parsing failures. Each
//! retry folds the failing code and its diagnostic into a correction
//! request; a terminal failure is returned as a structured error, never
//! a panic.

pub mod memory;
pub mod state;
pub mod training;

pub use memory::ConversationMemory;
pub use state::ConversationState;
pub use training::{InMemoryVectorStore, TrainingExample, VectorStore};

use std::sync::Arc;

use llm_contracts::{ChatMessage, CompletionRequest};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::dataset::{validate_session_datasets, Dataset};
use crate::errors::{Result, SlateError};
use crate::llm::{extract_program_text, CompletionAdapter};
use crate::prompts::PromptBuilder;
use crate::query::{QueryRouter, SourceRegistry};
use crate::response::{parse_result, Answer, ChatResponse, ErrorResponse, OutputKind};
use crate::sandbox::{InProcessSandbox, Sandbox};
use crate::validate::{CodeValidator, ValidatedProgram};

/// Training examples folded into a first-attempt instruction.
const MAX_TRAINING_EXAMPLES: usize = 2;

/// Outcome of one conversation turn.
pub type TurnResult = std::result::Result<ChatResponse, ErrorResponse>;

/// How the next generation request frames the previous failure.
enum Correction {
    Traceback { code: String, diagnostic: String },
    OutputType { code: String, expected: OutputKind },
}

pub struct Agent {
    config: AgentConfig,
    datasets: Vec<Dataset>,
    registry: Arc<SourceRegistry>,
    adapter: Arc<dyn CompletionAdapter>,
    sandbox: Arc<dyn Sandbox>,
    vector_store: Option<Arc<dyn VectorStore>>,
    state: ConversationState,
    session_id: String,
}

impl Agent {
    pub fn new(
        datasets: Vec<Dataset>,
        config: AgentConfig,
        adapter: Arc<dyn CompletionAdapter>,
    ) -> Result<Self> {
        config.validate()?;
        validate_session_datasets(&datasets)?;
        let session_id = Uuid::new_v4().to_string();
        let registry = Arc::new(SourceRegistry::build(&session_id, &datasets)?);
        let router = Arc::new(QueryRouter::new(Arc::clone(&registry)));
        let sandbox: Arc<dyn Sandbox> =
            Arc::new(InProcessSandbox::new(router, &datasets, config.max_interpreter_steps));
        let state = ConversationState::new(config.memory_size);
        info!(session = %session_id, datasets = datasets.len(), "agent ready");
        Ok(Self {
            config,
            datasets,
            registry,
            adapter,
            sandbox,
            vector_store: None,
            state,
            session_id,
        })
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Swaps in an external execution service for the in-process one.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn last_code(&self) -> Option<&str> {
        self.state.last_code.as_deref()
    }

    pub fn start_new_conversation(&mut self) {
        self.state.reset();
    }

    /// Answers a question in a fresh conversation.
    pub async fn chat(&mut self, question: &str) -> TurnResult {
        self.start_new_conversation();
        self.run_turn(question, None).await
    }

    /// Like [`Agent::chat`] but with a declared answer shape the program
    /// must produce.
    pub async fn chat_expecting(&mut self, question: &str, expected: OutputKind) -> TurnResult {
        self.start_new_conversation();
        self.run_turn(question, Some(expected)).await
    }

    /// Continues the current conversation with its history intact.
    pub async fn follow_up(&mut self, question: &str) -> TurnResult {
        self.run_turn(question, None).await
    }

    /// Like [`Agent::follow_up`] but with a declared answer shape.
    pub async fn follow_up_expecting(
        &mut self,
        question: &str,
        expected: OutputKind,
    ) -> TurnResult {
        self.run_turn(question, Some(expected)).await
    }

    /// Stores curated question/program pairs for prompt enrichment.
    pub async fn train(&self, examples: Vec<TrainingExample>) -> Result<()> {
        let store = self.vector_store.as_deref().ok_or(SlateError::MissingVectorStore)?;
        store.add(examples).await
    }

    #[instrument(skip(self, question), fields(session = %self.session_id))]
    async fn run_turn(&mut self, question: &str, expected: Option<OutputKind>) -> TurnResult {
        let turn_id = self.state.begin_turn(expected);
        let history = self.state.memory.messages();
        info!(turn = %turn_id, question, "starting turn");
        let outcome = self.drive(turn_id, question, expected, &history).await;
        self.state.memory.push_user(question);
        match outcome {
            Ok(response) => {
                self.state.memory.push_assistant(memory_summary(&response.answer));
                Ok(response)
            }
            Err(error) => {
                warn!(turn = %turn_id, %error, "turn failed");
                self.state.memory.push_assistant(error.to_string());
                Err(ErrorResponse::new(&error, self.state.last_code.clone()))
            }
        }
    }

    /// The retry loop. Generation and validation share one budget,
    /// execution and parsing the other; for `max_retries = N` each class
    /// gets at most `N + 1` attempts before its failure is terminal.
    async fn drive(
        &mut self,
        turn_id: Uuid,
        question: &str,
        expected: Option<OutputKind>,
        history: &[ChatMessage],
    ) -> Result<ChatResponse> {
        let mut generation_retries = 0u32;
        let mut execution_retries = 0u32;
        let mut correction: Option<Correction> = None;
        loop {
            let validated = loop {
                match self
                    .generate_and_validate(turn_id, question, expected, correction.as_ref(), history)
                    .await
                {
                    Ok(validated) => break validated,
                    Err(error)
                        if error.is_recoverable()
                            && generation_retries < self.config.max_retries =>
                    {
                        generation_retries += 1;
                        warn!(%error, retry = generation_retries, "generation attempt failed");
                        // A provider hiccup retries the same instruction;
                        // everything else shows the model what it wrote.
                        if !matches!(error, SlateError::Generation { .. }) {
                            correction = Some(Correction::Traceback {
                                code: self.state.last_code.clone().unwrap_or_default(),
                                diagnostic: error.diagnostic(),
                            });
                        }
                    }
                    Err(error) => return Err(error),
                }
            };
            match self.execute_and_parse(&validated, expected).await {
                Ok(answer) => {
                    info!(kind = answer.kind().as_str(), "turn answered");
                    return Ok(ChatResponse { answer, code: validated.text });
                }
                Err(error)
                    if error.is_recoverable() && execution_retries < self.config.max_retries =>
                {
                    execution_retries += 1;
                    warn!(%error, retry = execution_retries, "execution attempt failed");
                    correction = Some(correction_for(&error, expected, validated.text.clone()));
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn generate_and_validate(
        &mut self,
        turn_id: Uuid,
        question: &str,
        expected: Option<OutputKind>,
        correction: Option<&Correction>,
        history: &[ChatMessage],
    ) -> Result<ValidatedProgram> {
        let builder = PromptBuilder::new(&self.config, &self.datasets);
        let instruction = match correction {
            None => {
                let examples = self.relevant_examples(question).await;
                builder.question_instruction(question, expected, &examples)
            }
            Some(Correction::Traceback { code, diagnostic }) => {
                builder.fix_error_instruction(question, code, diagnostic)
            }
            Some(Correction::OutputType { code, expected }) => {
                builder.fix_output_type_instruction(question, code, *expected)
            }
        };
        let mut messages = history.to_vec();
        messages.push(ChatMessage::user(instruction));
        let request = CompletionRequest::new(builder.system_prompt(), messages)
            .with_conversation_id(turn_id);
        self.state.last_request = Some(request.clone());
        debug!(request = %request.id, "requesting program");
        let response = self.adapter.complete(request).await.map_err(SlateError::from)?;
        let text = extract_program_text(&response.content);
        if text.is_empty() {
            return Err(SlateError::invalid_code("the model returned an empty program"));
        }
        self.state.last_code = Some(text.clone());
        let validator = CodeValidator::new(&self.config, &self.datasets, self.registry.mapping());
        let validated = validator.validate(&text)?;
        // The rewritten text is what will execute, so it supersedes the
        // raw generation in the turn record.
        self.state.last_code = Some(validated.text.clone());
        Ok(validated)
    }

    async fn execute_and_parse(
        &self,
        validated: &ValidatedProgram,
        expected: Option<OutputKind>,
    ) -> Result<Answer> {
        let outcome = self.sandbox.execute(validated).await?;
        parse_result(&outcome.value, expected)
    }

    async fn relevant_examples(&self, question: &str) -> Vec<TrainingExample> {
        let Some(store) = &self.vector_store else {
            return Vec::new();
        };
        match store.search(question, MAX_TRAINING_EXAMPLES).await {
            Ok(examples) => examples,
            Err(error) => {
                warn!(%error, "example lookup failed, continuing without examples");
                Vec::new()
            }
        }
    }
}

fn correction_for(error: &SlateError, expected: Option<OutputKind>, code: String) -> Correction {
    if let SlateError::InvalidOutputType { expected: want, .. } = error {
        if let Some(kind) = expected.or_else(|| OutputKind::from_declared(want)) {
            return Correction::OutputType { code, expected: kind };
        }
    }
    Correction::Traceback { code, diagnostic: error.diagnostic() }
}

fn memory_summary(answer: &Answer) -> String {
    match answer {
        Answer::Text(text) => text.clone(),
        Answer::Number(n) => n.to_string(),
        Answer::Table(frame) => {
            format!("[{} rows x {} columns dataframe]", frame.height(), frame.width())
        }
        Answer::Plot(chart) => format!("[{} chart]", chart.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedAdapter;
    use llm_contracts::LLMError;
    use polars::df;

    fn sales() -> Dataset {
        Dataset::new_local(
            "sales",
            df!(
                "cid" => [1i64, 2, 3],
                "amount" => [100i64, 250, 80],
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn agent_with(replies: &[&str], max_retries: u32) -> (Agent, Arc<ScriptedAdapter>) {
        let adapter = Arc::new(ScriptedAdapter::new(replies.to_vec()));
        let mut config = AgentConfig::default();
        config.max_retries = max_retries;
        let agent = Agent::new(vec![sales()], config, adapter.clone()).unwrap();
        (agent, adapter)
    }

    const SUM_PROGRAM: &str =
        "import stats\nresult = {\"type\": \"number\", \"value\": sum(sales, \"amount\")}\n";

    #[tokio::test]
    async fn a_clean_program_answers_in_one_attempt() {
        let (mut agent, adapter) = agent_with(&[SUM_PROGRAM], 3);
        let response = agent.chat("what is the total amount?").await.unwrap();
        assert!(matches!(response.answer, Answer::Number(n) if n == 430.0));
        assert_eq!(response.code, SUM_PROGRAM);
        assert_eq!(adapter.request_count().await, 1);
    }

    #[tokio::test]
    async fn validation_failures_feed_code_and_diagnostic_into_the_retry() {
        let bad = "import sockets\nresult = 1\n";
        let (mut agent, adapter) = agent_with(&[bad, SUM_PROGRAM], 1);
        let response = agent.chat("total?").await.unwrap();
        assert!(matches!(response.answer, Answer::Number(n) if n == 430.0));

        let requests = adapter.requests().await;
        assert_eq!(requests.len(), 2);
        let retry_text = requests[1].latest_user_text().unwrap();
        assert!(retry_text.contains("import sockets"));
        assert!(retry_text.contains("Restricted module import: sockets"));
        assert!(retry_text.contains("total?"));
    }

    #[tokio::test]
    async fn execution_failures_feed_the_captured_diagnostic_verbatim() {
        let crashing = "result = 1 / 0\n";
        let (mut agent, adapter) = agent_with(&[crashing, SUM_PROGRAM], 1);
        let response = agent.chat("total?").await.unwrap();
        assert!(matches!(response.answer, Answer::Number(n) if n == 430.0));

        let requests = adapter.requests().await;
        assert_eq!(requests.len(), 2);
        let retry_text = requests[1].latest_user_text().unwrap();
        assert!(retry_text.contains("result = 1 / 0"));
        assert!(retry_text.contains("line 1: division by zero"));
    }

    #[tokio::test]
    async fn zero_retries_makes_the_first_failure_terminal() {
        let bad = "import sockets\nresult = 1\n";
        let (mut agent, adapter) = agent_with(&[bad, SUM_PROGRAM], 0);
        let error = agent.chat("total?").await.unwrap_err();
        assert!(error.message.contains("Restricted module import"));
        assert_eq!(error.last_code_executed.as_deref(), Some(bad));
        assert_eq!(adapter.request_count().await, 1);
    }

    #[tokio::test]
    async fn an_exhausted_budget_surfaces_the_last_failure() {
        let bad = "import sockets\nresult = 1\n";
        let (mut agent, adapter) = agent_with(&[bad, bad, bad], 2);
        let error = agent.chat("total?").await.unwrap_err();
        assert!(error.message.contains("Restricted module import"));
        assert_eq!(adapter.request_count().await, 3);
    }

    #[tokio::test]
    async fn declared_output_kind_mismatches_use_the_output_type_framing() {
        let stringy = "result = {\"type\": \"string\", \"value\": \"lots\"}\n";
        let (mut agent, adapter) = agent_with(&[stringy, SUM_PROGRAM], 1);
        let response = agent
            .chat_expecting("total?", OutputKind::Number)
            .await
            .unwrap();
        assert!(matches!(response.answer, Answer::Number(n) if n == 430.0));

        let retry_text = adapter.requests().await[1].latest_user_text().unwrap().to_string();
        assert!(retry_text.contains("wrong result type"));
        assert!(retry_text.contains("\"number\""));
    }

    #[tokio::test]
    async fn provider_failures_are_terminal_when_not_transient() {
        let adapter = Arc::new(ScriptedAdapter::new(Vec::<String>::new()));
        adapter.push_failure(LLMError::Network("connection refused".into())).await;
        let mut agent = Agent::new(vec![sales()], AgentConfig::default(), adapter.clone()).unwrap();
        let error = agent.chat("total?").await.unwrap_err();
        assert!(error.message.contains("Model API call failed"));
        assert_eq!(adapter.request_count().await, 1);
    }

    #[tokio::test]
    async fn transient_provider_failures_retry_the_same_instruction() {
        let adapter = Arc::new(ScriptedAdapter::new(Vec::<String>::new()));
        adapter.push_failure(LLMError::Timeout).await;
        let mut config = AgentConfig::default();
        config.max_retries = 1;
        let mut agent = Agent::new(vec![sales()], config, adapter.clone()).unwrap();
        // Queue the successful reply behind the failure.
        adapter.push_reply(SUM_PROGRAM).await;
        let response = agent.chat("total?").await.unwrap();
        assert!(matches!(response.answer, Answer::Number(n) if n == 430.0));

        let requests = adapter.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].latest_user_text(),
            requests[1].latest_user_text(),
        );
    }

    #[tokio::test]
    async fn follow_ups_keep_history_and_new_chats_drop_it() {
        let (mut agent, adapter) = agent_with(&[SUM_PROGRAM, SUM_PROGRAM, SUM_PROGRAM], 0);
        agent.chat("first question").await.unwrap();
        agent.follow_up("and as a chart?").await.unwrap();

        let requests = adapter.requests().await;
        let follow_up_history: Vec<&str> =
            requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert!(follow_up_history.contains(&"first question"));
        assert_eq!(follow_up_history.last(), Some(&"and as a chart?"));

        agent.chat("unrelated question").await.unwrap();
        let requests = adapter.requests().await;
        let fresh = &requests[2];
        assert_eq!(fresh.messages.len(), 1);
        assert_eq!(fresh.latest_user_text(), Some("unrelated question"));
    }

    #[tokio::test]
    async fn training_requires_a_vector_store() {
        let (agent, _) = agent_with(&[], 0);
        let err = agent
            .train(vec![TrainingExample::new("q", "result = 1\n")])
            .await
            .unwrap_err();
        assert_eq!(err, SlateError::MissingVectorStore);
    }

    #[tokio::test]
    async fn trained_examples_surface_in_the_first_instruction() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![SUM_PROGRAM]));
        let store = Arc::new(InMemoryVectorStore::new());
        let mut agent = Agent::new(vec![sales()], AgentConfig::default(), adapter.clone())
            .unwrap()
            .with_vector_store(store);
        agent
            .train(vec![TrainingExample::new("total amount of sales", SUM_PROGRAM)])
            .await
            .unwrap();
        agent.chat("what is the total amount?").await.unwrap();

        let first = adapter.requests().await[0].latest_user_text().unwrap().to_string();
        assert!(first.contains("<example>"));
        assert!(first.contains("total amount of sales"));
    }
}
