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

use crate::errors::{Result, SlateError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

fn default_max_retries() -> u32 {
    3
}
fn default_direct_sql() -> bool {
    false
}
fn default_allowed_imports() -> Vec<String> {
    vec!["frames".to_string(), "stats".to_string(), "charts".to_string()]
}
fn default_memory_size() -> usize {
    10
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_max_interpreter_steps() -> u64 {
    100_000
}

/// Per-session configuration for the analysis agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Retry budget per failure class within one turn. `0` makes any
    /// recoverable failure immediately terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Whether generated code may define its own raw-SQL execution function.
    #[serde(default = "default_direct_sql")]
    pub direct_sql: bool,

    /// Modules generated code is allowed to import, in declaration order.
    #[serde(default = "default_allowed_imports")]
    pub allowed_imports: Vec<String>,

    /// Upper bound on retained conversation messages.
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,

    /// Model identifier passed to the completion provider.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Evaluation step budget for one generated program.
    #[serde(default = "default_max_interpreter_steps")]
    pub max_interpreter_steps: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            direct_sql: default_direct_sql(),
            allowed_imports: default_allowed_imports(),
            memory_size: default_memory_size(),
            model: default_model(),
            request_timeout_secs: default_request_timeout_secs(),
            max_interpreter_steps: default_max_interpreter_steps(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| SlateError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SlateError::config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Loads configuration from `path`, falling back to defaults when the
    /// file is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load agent config from {}: {e}. Using defaults.",
                    path.as_ref().display()
                );
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_size == 0 {
            return Err(SlateError::config("memory_size must be at least 1"));
        }
        if self.max_interpreter_steps == 0 {
            return Err(SlateError::config("max_interpreter_steps must be positive"));
        }
        if self.model.trim().is_empty() {
            return Err(SlateError::config("model must not be empty"));
        }
        Ok(())
    }

    pub fn import_allowed(&self, module: &str) -> bool {
        self.allowed_imports.iter().any(|m| m == module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(!config.direct_sql);
        assert_eq!(config.allowed_imports, vec!["frames", "stats", "charts"]);
        assert_eq!(config.memory_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = AgentConfig::from_toml_str("max_retries = 1\ndirect_sql = true\n").unwrap();
        assert_eq!(config.max_retries, 1);
        assert!(config.direct_sql);
        assert_eq!(config.memory_size, 10);
    }

    #[test]
    fn zero_memory_rejected() {
        let err = AgentConfig::from_toml_str("memory_size = 0\n").unwrap_err();
        assert!(matches!(err, SlateError::Config { .. }));
    }

    #[test]
    fn import_allowed_respects_list() {
        let config = AgentConfig::default();
        assert!(config.import_allowed("frames"));
        assert!(!config.import_allowed("os"));
    }
}
