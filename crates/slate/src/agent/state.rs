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

use llm_contracts::CompletionRequest;
use uuid::Uuid;

use crate::agent::ConversationMemory;
use crate::response::OutputKind;

/// Per-conversation mutable state. Only the orchestrator touches it, and
/// every field is replaced whole so an abandoned turn can never leave a
/// half-written record behind.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub memory: ConversationMemory,
    /// Text of the most recently generated program, raw until validation
    /// succeeds, rewritten afterwards.
    pub last_code: Option<String>,
    /// The most recently issued generation request.
    pub last_request: Option<CompletionRequest>,
    /// Correlation identifier for the turn in flight.
    pub turn_id: Option<Uuid>,
    /// Declared answer shape for the turn in flight.
    pub expected_output: Option<OutputKind>,
}

impl ConversationState {
    pub fn new(memory_size: usize) -> Self {
        Self {
            memory: ConversationMemory::new(memory_size),
            last_code: None,
            last_request: None,
            turn_id: None,
            expected_output: None,
        }
    }

    /// Forgets everything from prior turns while keeping the memory bound.
    pub fn reset(&mut self) {
        self.memory.clear();
        self.last_code = None;
        self.last_request = None;
        self.turn_id = None;
        self.expected_output = None;
    }

    pub fn begin_turn(&mut self, expected: Option<OutputKind>) -> Uuid {
        let turn_id = Uuid::new_v4();
        self.turn_id = Some(turn_id);
        self.expected_output = expected;
        turn_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_turn_records_but_keeps_the_bound() {
        let mut state = ConversationState::new(2);
        state.memory.push_user("hello");
        state.last_code = Some("result = 1\n".to_string());
        state.begin_turn(Some(OutputKind::Number));
        state.reset();
        assert!(state.memory.is_empty());
        assert!(state.last_code.is_none());
        assert!(state.turn_id.is_none());
        assert!(state.expected_output.is_none());

        state.memory.push_user("one");
        state.memory.push_assistant("two");
        state.memory.push_user("three");
        assert_eq!(state.memory.len(), 2);
    }
}
