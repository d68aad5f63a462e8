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

pub mod core;
pub mod openai;
pub mod scripted;

pub use core::CompletionAdapter;
pub use openai::OpenAiAdapter;
pub use scripted::ScriptedAdapter;

/// Pulls program text out of a model reply. Models wrap code in markdown
/// fences with or without a language tag, and occasionally in a JSON
/// object under a `code` key; both wrappers are unwrapped before the text
/// reaches the validator.
pub fn extract_program_text(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    if text.starts_with("```") {
        match text.find('\n') {
            Some(pos) => text = text[pos + 1..].to_string(),
            None => return String::new(),
        }
        if let Some(end) = text.rfind("```") {
            text = text[..end].to_string();
        }
        text = text.trim().to_string();
    }
    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Some(code) = value.get("code").and_then(|v| v.as_str()) {
                return extract_program_text(code);
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_text_passes_through_trimmed() {
        assert_eq!(extract_program_text("  result = 1\n"), "result = 1");
    }

    #[test]
    fn fenced_code_is_unwrapped() {
        let raw = "```\nimport frames\nresult = 1\n```";
        assert_eq!(extract_program_text(raw), "import frames\nresult = 1");
    }

    #[test]
    fn language_tags_are_dropped_with_the_fence() {
        let raw = "```python\nresult = 1\n```\n";
        assert_eq!(extract_program_text(raw), "result = 1");
    }

    #[test]
    fn json_code_wrapper_is_unwrapped() {
        let raw = r#"{"code": "result = 1\n"}"#;
        assert_eq!(extract_program_text(raw), "result = 1");
    }

    #[test]
    fn fenced_json_wrapper_is_unwrapped_twice() {
        let raw = "```json\n{\"code\": \"result = 1\"}\n```";
        assert_eq!(extract_program_text(raw), "result = 1");
    }

    #[test]
    fn map_literals_in_programs_are_not_mistaken_for_wrappers() {
        let raw = "result = {\"type\": \"number\", \"value\": 3}";
        assert_eq!(extract_program_text(raw), raw);
    }
}
