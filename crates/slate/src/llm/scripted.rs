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

use std::collections::VecDeque;

use async_trait::async_trait;
use llm_contracts::{CompletionRequest, CompletionResponse, LLMError, LLMResult};
use tokio::sync::Mutex;

use crate::llm::CompletionAdapter;

/// Deterministic adapter that replays canned replies in order and records
/// every request it saw. Exists for tests and offline demos; an exhausted
/// script fails the same way a dead provider would.
pub struct ScriptedAdapter {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

enum ScriptedReply {
    Content(String),
    Failure(LLMError),
}

impl ScriptedAdapter {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(
                replies.into_iter().map(|r| ScriptedReply::Content(r.into())).collect(),
            ),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues another reply behind whatever is already scripted.
    pub async fn push_reply(&self, content: impl Into<String>) {
        self.replies.lock().await.push_back(ScriptedReply::Content(content.into()));
    }

    /// Queues a failure to be returned in place of the next reply.
    pub async fn push_failure(&self, error: LLMError) {
        self.replies.lock().await.push_back(ScriptedReply::Failure(error));
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl CompletionAdapter for ScriptedAdapter {
    async fn complete(&self, request: CompletionRequest) -> LLMResult<CompletionResponse> {
        self.requests.lock().await.push(request.clone());
        let reply = self.replies.lock().await.pop_front().ok_or_else(|| {
            LLMError::Provider("scripted adapter has no replies left".to_string())
        })?;
        match reply {
            ScriptedReply::Content(content) => Ok(CompletionResponse::new(request.id, content)),
            ScriptedReply::Failure(error) => Err(error),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_contracts::ChatMessage;

    #[tokio::test]
    async fn replies_are_replayed_in_order_and_requests_recorded() {
        let adapter = ScriptedAdapter::new(["result = 1\n", "result = 2\n"]);
        let first = adapter
            .complete(CompletionRequest::new("sys", vec![ChatMessage::user("a")]))
            .await
            .unwrap();
        let second = adapter
            .complete(CompletionRequest::new("sys", vec![ChatMessage::user("b")]))
            .await
            .unwrap();
        assert_eq!(first.content, "result = 1\n");
        assert_eq!(second.content, "result = 2\n");
        assert_eq!(adapter.request_count().await, 2);
        assert_eq!(adapter.requests().await[1].latest_user_text(), Some("b"));
    }

    #[tokio::test]
    async fn exhausted_script_surfaces_a_provider_error() {
        let adapter = ScriptedAdapter::new(Vec::<String>::new());
        let err = adapter
            .complete(CompletionRequest::new("sys", vec![ChatMessage::user("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::Provider(_)));
    }

    #[tokio::test]
    async fn queued_failures_are_returned_in_turn() {
        let adapter = ScriptedAdapter::new(Vec::<String>::new());
        adapter.push_failure(LLMError::Timeout).await;
        let err = adapter
            .complete(CompletionRequest::new("sys", vec![ChatMessage::user("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::Timeout));
    }
}
