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

//! Executes session SQL against the right backend. Every query is pushed
//! through [`rewrite_sql`] first, so dynamically built strings get the
//! same table policing as literals the validator already rewrote.

use std::sync::Arc;

use async_trait::async_trait;
use polars::prelude::{DataFrame, IntoLazy, LazyFrame};
use polars::sql::SQLContext;
use tracing::debug;

use super::registry::{ExecutorChoice, SourceRegistry};
use super::rewrite::rewrite_sql;
use crate::errors::{Result, SlateError};
use crate::script::SqlCapability;

pub struct QueryRouter {
    registry: Arc<SourceRegistry>,
}

impl QueryRouter {
    pub fn new(registry: Arc<SourceRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(&self, sql: &str) -> Result<DataFrame> {
        let rewritten = rewrite_sql(sql, self.registry.mapping())?;
        match self.registry.executor() {
            ExecutorChoice::Delegate(executor) => {
                debug!(sql = %rewritten, "routing query to remote connector");
                executor.query(&rewritten).await
            }
            ExecutorChoice::InProcess => {
                debug!(sql = %rewritten, "routing query to in-process engine");
                self.run_in_process(&rewritten)
            }
        }
    }

    fn run_in_process(&self, sql: &str) -> Result<DataFrame> {
        let mut context = SQLContext::new();
        for (physical, frame) in self.registry.local_tables() {
            context.register(physical, frame.clone().lazy());
        }
        context
            .execute(sql)
            .and_then(LazyFrame::collect)
            .map_err(|e| SlateError::code_execution(format!("SQL execution failed: {e}")))
    }
}

#[async_trait]
impl SqlCapability for QueryRouter {
    async fn execute_sql(&self, sql: &str) -> Result<DataFrame> {
        self.run(sql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, RemoteExecutor, SqlConnection};
    use polars::df;
    use std::sync::Mutex;

    fn session() -> Arc<SourceRegistry> {
        let sales = Dataset::new_local(
            "sales",
            df!(
                "cid" => [1i64, 2, 3],
                "amount" => [100i64, 250, 80],
            )
            .unwrap(),
        )
        .unwrap();
        let customers = Dataset::new_local(
            "customers",
            df!(
                "id" => [1i64, 2],
                "name" => ["Asha", "Bram"],
            )
            .unwrap(),
        )
        .unwrap();
        Arc::new(SourceRegistry::build("11112222-3333", &[sales, customers]).unwrap())
    }

    #[tokio::test]
    async fn joins_across_local_datasets_run_in_process() {
        let router = QueryRouter::new(session());
        let joined = router
            .run("SELECT * FROM sales JOIN customers ON sales.cid = customers.id")
            .await
            .unwrap();
        assert_eq!(joined.height(), 2);
        assert_eq!(joined.width(), 4);
    }

    #[tokio::test]
    async fn undeclared_tables_never_reach_the_engine() {
        let router = QueryRouter::new(session());
        let err = router.run("SELECT * FROM orders").await.unwrap_err();
        assert!(matches!(err, SlateError::MaliciousQuery { .. }));
    }

    #[tokio::test]
    async fn aggregates_come_back_as_single_row_frames() {
        let router = QueryRouter::new(session());
        let frame = router
            .run("SELECT SUM(amount) AS total FROM sales")
            .await
            .unwrap();
        assert_eq!(frame.height(), 1);
        let total = frame
            .column("total")
            .unwrap()
            .as_materialized_series()
            .get(0)
            .unwrap();
        assert_eq!(total.to_string(), "430");
    }

    struct RecordingRemote {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteExecutor for RecordingRemote {
        fn table_expression(&self) -> String {
            "public.orders".to_string()
        }

        async fn query(&self, sql: &str) -> Result<DataFrame> {
            self.seen.lock().unwrap().push(sql.to_string());
            Ok(df!("n" => [1i64]).unwrap())
        }
    }

    #[tokio::test]
    async fn remote_sessions_delegate_the_rewritten_query() {
        let remote = Arc::new(RecordingRemote { seen: Mutex::new(Vec::new()) });
        let dataset = Dataset::new_remote(
            "orders",
            df!("id" => [1i64]).unwrap(),
            SqlConnection {
                host: "db.internal".into(),
                port: 5432,
                database: "shop".into(),
                user: "reader".into(),
            },
            "public.orders",
            remote.clone(),
        )
        .unwrap();
        let registry = Arc::new(SourceRegistry::build("session", &[dataset]).unwrap());
        let router = QueryRouter::new(registry);
        router.run("SELECT * FROM orders").await.unwrap();
        let seen = remote.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["SELECT * FROM public.orders AS orders"]);
    }
}
