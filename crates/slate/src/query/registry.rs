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

//! Maps each logical dataset to its physical backing. Local frames are
//! registered into the shared in-process engine under session-scoped
//! names so concurrent sessions cannot collide; remote datasets keep the
//! table expression their connector reports.

use std::fmt;
use std::sync::Arc;

use polars::prelude::DataFrame;
use tracing::debug;

use crate::dataset::{ensure_compatible, Dataset, DatasetSchema, RemoteExecutor};
use crate::errors::{Result, SlateError};

/// One logical table and the expression that must replace it in SQL.
#[derive(Debug, Clone)]
pub struct MappedTable {
    pub logical: String,
    pub physical: String,
    pub schema: DatasetSchema,
}

/// Translation from SQL-visible table identifiers to physical table
/// expressions. Built fresh per turn and never persisted.
#[derive(Debug, Clone, Default)]
pub struct TableMapping {
    entries: Vec<MappedTable>,
}

impl TableMapping {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(
        &mut self,
        logical: impl Into<String>,
        physical: impl Into<String>,
        schema: DatasetSchema,
    ) {
        self.entries.push(MappedTable {
            logical: logical.into(),
            physical: physical.into(),
            schema,
        });
    }

    /// Case-insensitive lookup by logical name, falling back to the
    /// physical expression so an already-rewritten query resolves to the
    /// same entry and a second rewrite is a no-op.
    pub fn resolve(&self, reference: &str) -> Option<&MappedTable> {
        self.entries
            .iter()
            .find(|entry| entry.logical.eq_ignore_ascii_case(reference))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| entry.physical.eq_ignore_ascii_case(reference))
            })
    }

    pub fn tables(&self) -> impl Iterator<Item = &MappedTable> {
        self.entries.iter()
    }

    pub fn logical_names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.logical.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How the session's single physical executor was chosen.
#[derive(Clone)]
pub enum ExecutorChoice {
    /// A remote dataset's own connector runs the final query.
    Delegate(Arc<dyn RemoteExecutor>),
    /// All datasets are local; the shared in-process engine runs it.
    InProcess,
}

impl fmt::Debug for ExecutorChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delegate(_) => f.write_str("ExecutorChoice::Delegate"),
            Self::InProcess => f.write_str("ExecutorChoice::InProcess"),
        }
    }
}

/// Physical view of the session's datasets: the table mapping, the
/// chosen executor and the frames to register in-process.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    mapping: TableMapping,
    executor: ExecutorChoice,
    local_tables: Vec<(String, DataFrame)>,
}

impl SourceRegistry {
    pub fn build(session_id: &str, datasets: &[Dataset]) -> Result<Self> {
        if datasets.is_empty() {
            return Err(SlateError::config("a session requires at least one dataset"));
        }
        // Re-checked here although session start already validated it.
        let sources: Vec<_> = datasets.iter().map(|d| d.source()).collect();
        ensure_compatible(&sources)?;

        let tag = session_tag(session_id);
        let mut mapping = TableMapping::new();
        let mut local_tables = Vec::new();
        let mut delegate: Option<Arc<dyn RemoteExecutor>> = None;
        for dataset in datasets {
            let physical = match dataset.executor() {
                Some(executor) => {
                    let expression = executor.table_expression();
                    if delegate.is_none() {
                        delegate = Some(executor);
                    }
                    expression
                }
                None => {
                    let physical = format!("{}_{tag}", dataset.name());
                    local_tables.push((physical.clone(), dataset.frame().clone()));
                    physical
                }
            };
            debug!(dataset = dataset.name(), physical = %physical, "registered source");
            mapping.insert(dataset.name(), physical, dataset.schema().clone());
        }
        let executor = match delegate {
            Some(executor) => ExecutorChoice::Delegate(executor),
            None => ExecutorChoice::InProcess,
        };
        Ok(Self { mapping, executor, local_tables })
    }

    pub fn mapping(&self) -> &TableMapping {
        &self.mapping
    }

    pub fn executor(&self) -> &ExecutorChoice {
        &self.executor
    }

    pub fn local_tables(&self) -> &[(String, DataFrame)] {
        &self.local_tables
    }
}

/// Short per-session suffix for in-process table names.
fn session_tag(session_id: &str) -> String {
    let tag: String = session_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_lowercase();
    if tag.is_empty() {
        "local".to_string()
    } else {
        tag
    }
}
