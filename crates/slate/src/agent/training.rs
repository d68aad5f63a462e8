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

//! Optional question/program example store consulted during prompt
//! building. Production deployments back this with a vector database;
//! the in-memory implementation scores by word overlap and is good
//! enough for small curated example sets.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    pub question: String,
    pub code: String,
}

impl TrainingExample {
    pub fn new(question: impl Into<String>, code: impl Into<String>) -> Self {
        Self { question: question.into(), code: code.into() }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, examples: Vec<TrainingExample>) -> Result<()>;

    /// Examples most relevant to the question, best first.
    async fn search(&self, question: &str, limit: usize) -> Result<Vec<TrainingExample>>;
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    examples: RwLock<Vec<TrainingExample>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, examples: Vec<TrainingExample>) -> Result<()> {
        self.examples.write().await.extend(examples);
        Ok(())
    }

    async fn search(&self, question: &str, limit: usize) -> Result<Vec<TrainingExample>> {
        let query_words: Vec<String> = question
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let examples = self.examples.read().await;
        let mut scored: Vec<(usize, &TrainingExample)> = examples
            .iter()
            .map(|example| {
                let candidate = example.question.to_lowercase();
                let score = query_words
                    .iter()
                    .filter(|word| candidate.split_whitespace().any(|w| w == word.as_str()))
                    .count();
                (score, example)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, example)| example.clone()).collect())
    }
}
