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

use std::sync::Arc;

use polars::df;
use slate::{Agent, AgentConfig, Answer, Dataset, ScriptedAdapter};

const JOIN_PROGRAM: &str = "spend = execute_sql_query(\"SELECT customers.name AS name, SUM(sales.amount) AS total FROM sales JOIN customers ON sales.customer_id = customers.id GROUP BY customers.name ORDER BY total DESC\")\nresult = {\"type\": \"dataframe\", \"value\": spend}\n";

const ORDERS_PROGRAM: &str = "missing = execute_sql_query(\"SELECT * FROM orders\")\nresult = {\"type\": \"dataframe\", \"value\": missing}\n";

fn shop_datasets() -> Vec<Dataset> {
    let sales = Dataset::new_local(
        "sales",
        df!(
            "customer_id" => [1i64, 2, 1, 3],
            "amount" => [100i64, 250, 40, 80],
        )
        .unwrap(),
    )
    .unwrap();
    let customers = Dataset::new_local(
        "customers",
        df!(
            "id" => [1i64, 2, 3],
            "name" => ["Asha", "Bram", "Chen"],
        )
        .unwrap(),
    )
    .unwrap();
    vec![sales, customers]
}

#[tokio::test]
async fn a_join_question_is_answered_with_a_table() {
    let adapter = Arc::new(ScriptedAdapter::new([JOIN_PROGRAM]));
    let mut agent = Agent::new(shop_datasets(), AgentConfig::default(), adapter).unwrap();

    let response = agent
        .chat("Which customer spent the most in total?")
        .await
        .unwrap();

    let Answer::Table(frame) = &response.answer else {
        panic!("expected a table answer, got {:?}", response.answer.kind());
    };
    assert_eq!(frame.height(), 3);
    assert_eq!(frame.width(), 2);
    let top_total = frame
        .column("total")
        .unwrap()
        .as_materialized_series()
        .get(0)
        .unwrap();
    assert_eq!(top_total.to_string(), "250");
    assert!(response.code.contains("execute_sql_query"));
}

#[tokio::test]
async fn undeclared_tables_are_rejected_and_repaired_on_retry() {
    let adapter = Arc::new(ScriptedAdapter::new([ORDERS_PROGRAM, JOIN_PROGRAM]));
    let mut agent =
        Agent::new(shop_datasets(), AgentConfig::default(), adapter.clone()).unwrap();

    let response = agent.chat("Total spend per customer?").await.unwrap();
    assert!(matches!(response.answer, Answer::Table(_)));

    let requests = adapter.requests().await;
    assert_eq!(requests.len(), 2);
    let retry = requests[1].latest_user_text().unwrap();
    assert!(retry.contains("SELECT * FROM orders"));
    assert!(retry.contains("unknown table 'orders'"));
    assert!(retry.contains("Total spend per customer?"));
}

#[tokio::test]
async fn exhausted_repairs_surface_a_structured_error() {
    let mut config = AgentConfig::default();
    config.max_retries = 1;
    let adapter = Arc::new(ScriptedAdapter::new([ORDERS_PROGRAM, ORDERS_PROGRAM]));
    let mut agent = Agent::new(shop_datasets(), config, adapter.clone()).unwrap();

    let failure = agent.chat("List the orders table").await.unwrap_err();
    assert!(failure.message.contains("orders"));
    let code = failure.last_code_executed.as_deref().unwrap();
    assert!(code.contains("SELECT * FROM orders"));
    assert_eq!(adapter.request_count().await, 2);
}

#[tokio::test]
async fn follow_up_requests_carry_the_previous_exchange() {
    let adapter = Arc::new(ScriptedAdapter::new([JOIN_PROGRAM, JOIN_PROGRAM]));
    let mut agent =
        Agent::new(shop_datasets(), AgentConfig::default(), adapter.clone()).unwrap();

    agent.chat("Total spend per customer?").await.unwrap();
    agent.follow_up("And who comes first?").await.unwrap();

    let requests = adapter.requests().await;
    assert_eq!(requests.len(), 2);
    let contents: Vec<&str> =
        requests[1].messages.iter().map(|m| m.content.as_str()).collect();
    assert!(contents.iter().any(|text| text.contains("Total spend per customer?")));
    assert!(contents.last().unwrap().contains("And who comes first?"));
}

#[tokio::test]
async fn sessions_get_distinct_identifiers() {
    let first = Agent::new(
        shop_datasets(),
        AgentConfig::default(),
        Arc::new(ScriptedAdapter::new([JOIN_PROGRAM])),
    )
    .unwrap();
    let second = Agent::new(
        shop_datasets(),
        AgentConfig::default(),
        Arc::new(ScriptedAdapter::new([JOIN_PROGRAM])),
    )
    .unwrap();
    assert_ne!(first.session_id(), second.session_id());
}
