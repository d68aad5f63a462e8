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

use llm_contracts::ChatMessage;

/// Bounded conversation history. Oldest messages are evicted first once
/// the configured size is reached.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    messages: VecDeque<ChatMessage>,
    capacity: usize,
}

impl ConversationMemory {
    pub fn new(capacity: usize) -> Self {
        Self { messages: VecDeque::new(), capacity }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(ChatMessage::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(ChatMessage::assistant(text));
    }

    fn push(&mut self, message: ChatMessage) {
        if self.capacity == 0 {
            return;
        }
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_drops_the_oldest_messages() {
        let mut memory = ConversationMemory::new(3);
        memory.push_user("one");
        memory.push_assistant("two");
        memory.push_user("three");
        memory.push_assistant("four");
        assert_eq!(memory.len(), 3);
        assert_eq!(memory.messages()[0].content, "two");
        assert_eq!(memory.messages()[2].content, "four");
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut memory = ConversationMemory::new(0);
        memory.push_user("one");
        assert!(memory.is_empty());
    }
}
