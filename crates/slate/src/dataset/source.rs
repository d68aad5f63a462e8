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
use async_trait::async_trait;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Parquet,
}

/// Connection identity of a remote source. Credentials stay with the
/// executor implementation; identity only decides source compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConnection {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum DatasetSource {
    Local { path: PathBuf, format: FileFormat },
    Remote { connection: SqlConnection, table: String },
}

impl DatasetSource {
    pub fn is_remote(&self) -> bool {
        matches!(self, DatasetSource::Remote { .. })
    }

    pub fn connection(&self) -> Option<&SqlConnection> {
        match self {
            DatasetSource::Remote { connection, .. } => Some(connection),
            DatasetSource::Local { .. } => None,
        }
    }
}

/// Query surface a remote-backed dataset must supply: how the physical
/// engine references the table, and how to run SQL against it.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    fn table_expression(&self) -> String;

    /// Runs an already-rewritten query. Transient failures that the model
    /// could work around should surface as `SlateError::CodeExecution`;
    /// connectivity failures as `SlateError::ApiCall` (terminal).
    async fn query(&self, sql: &str) -> Result<DataFrame>;
}

/// Sessions may combine only datasets that one physical executor can serve:
/// every source local (or in-memory), or every source remote over the same
/// connection identity.
pub fn ensure_compatible(sources: &[Option<&DatasetSource>]) -> Result<()> {
    let mut first_remote: Option<&SqlConnection> = None;
    let mut saw_local = false;
    for source in sources {
        match source {
            Some(DatasetSource::Remote { connection, .. }) => match first_remote {
                None => first_remote = Some(connection),
                Some(existing) if existing == connection => {}
                Some(_) => {
                    return Err(SlateError::dataset(
                        "remote datasets must share one connection to be combined",
                    ))
                }
            },
            Some(DatasetSource::Local { .. }) | None => saw_local = true,
        }
    }
    if first_remote.is_some() && saw_local {
        return Err(SlateError::dataset(
            "local and remote datasets cannot be combined in one session",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(host: &str) -> SqlConnection {
        SqlConnection {
            host: host.to_string(),
            port: 5432,
            database: "analytics".to_string(),
            user: "reader".to_string(),
        }
    }

    fn remote(host: &str) -> DatasetSource {
        DatasetSource::Remote { connection: conn(host), table: "orders".to_string() }
    }

    fn local() -> DatasetSource {
        DatasetSource::Local { path: PathBuf::from("sales.csv"), format: FileFormat::Csv }
    }

    #[test]
    fn all_local_is_compatible() {
        let a = local();
        let b = local();
        assert!(ensure_compatible(&[Some(&a), Some(&b), None]).is_ok());
    }

    #[test]
    fn same_connection_remotes_are_compatible() {
        let a = remote("db1");
        let b = remote("db1");
        assert!(ensure_compatible(&[Some(&a), Some(&b)]).is_ok());
    }

    #[test]
    fn differing_connections_are_rejected() {
        let a = remote("db1");
        let b = remote("db2");
        assert!(ensure_compatible(&[Some(&a), Some(&b)]).is_err());
    }

    #[test]
    fn mixed_local_remote_is_rejected() {
        let a = local();
        let b = remote("db1");
        assert!(ensure_compatible(&[Some(&a), Some(&b)]).is_err());
    }
}
