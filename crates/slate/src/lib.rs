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

//! Conversational analysis over tabular datasets. A question goes to a
//! completion provider, which writes a short program in a small analysis
//! language; the program is statically validated and rewritten, executed
//! against the session's datasets through a multi-source SQL router, and
//! its result parsed into a typed answer. Failed attempts are folded
//! into bounded correction retries.

pub mod agent;
pub mod config;
pub mod dataset;
pub mod errors;
pub mod llm;
pub mod prompts;
pub mod query;
pub mod response;
pub mod sandbox;
pub mod script;
pub mod validate;

pub use agent::{Agent, InMemoryVectorStore, TrainingExample, TurnResult, VectorStore};
pub use config::AgentConfig;
pub use dataset::{Dataset, DatasetSchema, RemoteExecutor};
pub use errors::{Result, SlateError};
pub use llm::{CompletionAdapter, OpenAiAdapter, ScriptedAdapter};
pub use query::{QueryRouter, SourceRegistry, TableMapping};
pub use response::{Answer, ChatResponse, ErrorResponse, OutputKind};
pub use sandbox::{InProcessSandbox, Sandbox};
pub use validate::CodeValidator;
