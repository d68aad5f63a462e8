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

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlateError {
    #[error("Restricted module import: {module}")]
    BadImport { module: String },

    #[error("Malicious query detected: {reason}")]
    MaliciousQuery { reason: String },

    #[error("Invalid output type: expected {expected}, got {actual}")]
    InvalidOutputType { expected: String, actual: String },

    #[error("Code execution failed: {diagnostic}")]
    CodeExecution { diagnostic: String },

    #[error("Generated code could not be parsed: {reason}")]
    InvalidCode { reason: String },

    #[error("Code generation failed: {reason}")]
    Generation { reason: String },

    #[error("API key not found; set the SLATE_API_KEY environment variable or pass the key explicitly")]
    MissingApiKey,

    #[error("Model API call failed: {reason}")]
    ApiCall { reason: String },

    #[error("No vector store is configured for training")]
    MissingVectorStore,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Dataset error: {message}")]
    Dataset { message: String },
}

impl SlateError {
    pub fn bad_import(module: impl Into<String>) -> Self {
        Self::BadImport { module: module.into() }
    }

    pub fn malicious_query(reason: impl Into<String>) -> Self {
        Self::MaliciousQuery { reason: reason.into() }
    }

    pub fn invalid_output_type(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidOutputType { expected: expected.into(), actual: actual.into() }
    }

    pub fn code_execution(diagnostic: impl Into<String>) -> Self {
        Self::CodeExecution { diagnostic: diagnostic.into() }
    }

    pub fn invalid_code(reason: impl Into<String>) -> Self {
        Self::InvalidCode { reason: reason.into() }
    }

    pub fn generation(reason: impl Into<String>) -> Self {
        Self::Generation { reason: reason.into() }
    }

    pub fn api_call(reason: impl Into<String>) -> Self {
        Self::ApiCall { reason: reason.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn dataset(message: impl Into<String>) -> Self {
        Self::Dataset { message: message.into() }
    }

    /// Whether the orchestrator may fold this failure into a correction
    /// request and retry within the current turn.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BadImport { .. }
                | Self::MaliciousQuery { .. }
                | Self::InvalidOutputType { .. }
                | Self::CodeExecution { .. }
                | Self::InvalidCode { .. }
                | Self::Generation { .. }
        )
    }

    /// Diagnostic text suitable for a correction prompt.
    pub fn diagnostic(&self) -> String {
        match self {
            Self::CodeExecution { diagnostic } => diagnostic.clone(),
            other => other.to_string(),
        }
    }
}

impl From<llm_contracts::LLMError> for SlateError {
    fn from(e: llm_contracts::LLMError) -> Self {
        use llm_contracts::LLMError;
        match e {
            LLMError::Timeout => Self::generation("model request timed out"),
            LLMError::RateLimit => Self::generation("model rate limit exceeded"),
            LLMError::Configuration(m) => Self::config(m),
            other => Self::api_call(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SlateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification_matches_retry_policy() {
        assert!(SlateError::bad_import("os").is_recoverable());
        assert!(SlateError::malicious_query("unmapped table").is_recoverable());
        assert!(SlateError::invalid_output_type("number", "string").is_recoverable());
        assert!(SlateError::code_execution("boom").is_recoverable());
        assert!(SlateError::generation("timeout").is_recoverable());
        assert!(!SlateError::MissingApiKey.is_recoverable());
        assert!(!SlateError::api_call("503").is_recoverable());
        assert!(!SlateError::MissingVectorStore.is_recoverable());
        assert!(!SlateError::config("bad").is_recoverable());
    }

    #[test]
    fn model_collaborator_errors_map_by_transience() {
        let transient: SlateError = llm_contracts::LLMError::Timeout.into();
        assert!(transient.is_recoverable());
        let terminal: SlateError = llm_contracts::LLMError::Network("down".into()).into();
        assert!(!terminal.is_recoverable());
    }
}
