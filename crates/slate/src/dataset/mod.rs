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

pub mod describe;
pub mod schema;
pub mod source;

pub use describe::describe_for_prompt;
pub use schema::{ColumnSchema, ColumnType, DatasetSchema};
pub use source::{ensure_compatible, DatasetSource, FileFormat, RemoteExecutor, SqlConnection};

use crate::errors::{Result, SlateError};
use polars::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// A named tabular input, immutable for the lifetime of a session.
#[derive(Clone)]
pub struct Dataset {
    name: String,
    frame: DataFrame,
    schema: DatasetSchema,
    source: Option<DatasetSource>,
    executor: Option<Arc<dyn RemoteExecutor>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("rows", &self.frame.height())
            .field("columns", &self.frame.width())
            .field("source", &self.source)
            .field("remote", &self.executor.is_some())
            .finish()
    }
}

impl Dataset {
    /// In-memory local dataset with an inferred schema.
    pub fn new_local(name: impl Into<String>, frame: DataFrame) -> Result<Self> {
        let name = name.into();
        let schema = DatasetSchema::infer(name.clone(), &frame)?;
        Ok(Self { name, frame, schema, source: None, executor: None })
    }

    pub fn from_csv(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let frame = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(200))
            .try_into_reader_with_file_path(Some(path.to_path_buf()))
            .map_err(|e| SlateError::dataset(format!("cannot open {}: {e}", path.display())))?
            .finish()
            .map_err(|e| SlateError::dataset(format!("cannot read {}: {e}", path.display())))?;
        let name = name.into();
        let schema = DatasetSchema::infer(name.clone(), &frame)?;
        let source = Some(DatasetSource::Local { path: path.to_path_buf(), format: FileFormat::Csv });
        Ok(Self { name, frame, schema, source, executor: None })
    }

    pub fn from_parquet(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| SlateError::dataset(format!("cannot open {}: {e}", path.display())))?;
        let frame = ParquetReader::new(file)
            .finish()
            .map_err(|e| SlateError::dataset(format!("cannot read {}: {e}", path.display())))?;
        let name = name.into();
        let schema = DatasetSchema::infer(name.clone(), &frame)?;
        let source =
            Some(DatasetSource::Local { path: path.to_path_buf(), format: FileFormat::Parquet });
        Ok(Self { name, frame, schema, source, executor: None })
    }

    /// Remote-backed dataset. `sample` feeds schema inference and prompt
    /// description; queries are answered by `executor`, never the sample.
    pub fn new_remote(
        name: impl Into<String>,
        sample: DataFrame,
        connection: SqlConnection,
        table: impl Into<String>,
        executor: Arc<dyn RemoteExecutor>,
    ) -> Result<Self> {
        let name = name.into();
        let schema = DatasetSchema::infer(name.clone(), &sample)?;
        let source = Some(DatasetSource::Remote { connection, table: table.into() });
        Ok(Self { name, frame: sample, schema, source, executor: Some(executor) })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.schema = self.schema.with_description(description);
        self
    }

    /// Replaces the inferred schema with a declared one, keeping the
    /// dataset's name. The declared columns must cover exactly the
    /// frame's columns (case-insensitive).
    pub fn with_schema(mut self, mut schema: DatasetSchema) -> Result<Self> {
        let declared: HashSet<String> =
            schema.column_names().iter().map(|c| c.to_lowercase()).collect();
        let actual: HashSet<String> = self
            .frame
            .get_column_names()
            .iter()
            .map(|c| c.as_str().to_lowercase())
            .collect();
        if declared != actual {
            return Err(SlateError::dataset(format!(
                "declared schema for '{}' does not match the frame's columns",
                self.name
            )));
        }
        schema.name = self.name.clone();
        self.schema = schema;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn source(&self) -> Option<&DatasetSource> {
        self.source.as_ref()
    }

    pub fn executor(&self) -> Option<Arc<dyn RemoteExecutor>> {
        self.executor.clone()
    }

    pub fn is_remote(&self) -> bool {
        self.executor.is_some()
    }

    pub fn row_count(&self) -> usize {
        self.frame.height()
    }

    pub fn column_count(&self) -> usize {
        self.frame.width()
    }

    pub fn head(&self, n: usize) -> DataFrame {
        self.frame.head(Some(n))
    }
}

/// Session-start validation: at least one dataset, unique well-formed names,
/// compatible sources.
pub fn validate_session_datasets(datasets: &[Dataset]) -> Result<()> {
    if datasets.is_empty() {
        return Err(SlateError::config("a session requires at least one dataset"));
    }
    let mut seen = HashSet::new();
    for dataset in datasets {
        schema::validate_dataset_name(dataset.name())?;
        if !seen.insert(dataset.name().to_string()) {
            return Err(SlateError::dataset(format!("duplicate dataset name '{}'", dataset.name())));
        }
    }
    let sources: Vec<Option<&DatasetSource>> = datasets.iter().map(Dataset::source).collect();
    source::ensure_compatible(&sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sales() -> Dataset {
        let frame = df!(
            "cid" => [1i64, 2, 3],
            "amount" => [100i64, 250, 80],
        )
        .unwrap();
        Dataset::new_local("sales", frame).unwrap()
    }

    #[test]
    fn local_dataset_infers_schema() {
        let dataset = sales();
        assert_eq!(dataset.row_count(), 3);
        assert_eq!(dataset.column_count(), 2);
        assert!(!dataset.is_remote());
        assert_eq!(dataset.schema().resolve_column("AMOUNT"), Some("amount"));
    }

    #[test]
    fn declared_schemas_replace_inference_when_columns_match() {
        let declared = DatasetSchema::new(
            "sales",
            vec![
                ColumnSchema {
                    name: "cid".into(),
                    dtype: ColumnType::Integer,
                    description: Some("customer id".into()),
                },
                ColumnSchema {
                    name: "amount".into(),
                    dtype: ColumnType::Integer,
                    description: Some("sale value in cents".into()),
                },
            ],
        )
        .unwrap();
        let dataset = sales().with_schema(declared).unwrap();
        assert_eq!(
            dataset.schema().column("amount").unwrap().description.as_deref(),
            Some("sale value in cents")
        );

        let mismatched = DatasetSchema::new(
            "sales",
            vec![ColumnSchema {
                name: "other".into(),
                dtype: ColumnType::Integer,
                description: None,
            }],
        )
        .unwrap();
        assert!(sales().with_schema(mismatched).is_err());
    }

    #[test]
    fn session_validation_rejects_duplicates() {
        let err = validate_session_datasets(&[sales(), sales()]).unwrap_err();
        assert!(matches!(err, SlateError::Dataset { .. }));
    }

    #[test]
    fn session_validation_rejects_empty() {
        let err = validate_session_datasets(&[]).unwrap_err();
        assert!(matches!(err, SlateError::Config { .. }));
    }

    #[test]
    fn csv_round_trip_through_tempfile() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "region,amount\nnorth,10\nsouth,20").unwrap();
        let dataset = Dataset::from_csv("sales", file.path()).unwrap();
        assert_eq!(dataset.row_count(), 2);
        assert_eq!(dataset.schema().column("amount").unwrap().dtype, ColumnType::Integer);
        assert!(matches!(
            dataset.source(),
            Some(DatasetSource::Local { format: FileFormat::Csv, .. })
        ));
    }
}
