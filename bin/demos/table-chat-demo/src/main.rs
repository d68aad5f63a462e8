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

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use slate::response::answer_to_json;
use slate::{Agent, AgentConfig, ChatResponse, Dataset, ErrorResponse, OpenAiAdapter};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(name = "table-chat-demo")]
#[command(
    about = "Ask questions about CSV or Parquet tables. A model writes a small analysis program per question; the agent validates, runs, and repairs it."
)]
struct Cli {
    /// Table files to load. Each file becomes a dataset named after its stem.
    #[arg(required = true)]
    tables: Vec<PathBuf>,
    /// Agent configuration file (TOML). Defaults apply when the file is absent.
    #[arg(long, default_value = "slate.toml")]
    config: PathBuf,
    /// Let generated programs call execute_sql_query directly.
    #[arg(long, default_value_t = false)]
    direct_sql: bool,
    /// Override the model named in the configuration.
    #[arg(long)]
    model: Option<String>,
    /// Print answers as JSON instead of formatted text.
    #[arg(long, default_value_t = false)]
    json: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("debug,reqwest=info,hyper=info,hyper_util=info,rustls=info")
        })
    } else {
        EnvFilter::new("info,reqwest=warn,hyper=warn,hyper_util=warn,rustls=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    info!("Starting Table Chat Demo");

    let mut config = AgentConfig::load_or_default(&cli.config);
    if cli.direct_sql {
        config.direct_sql = true;
    }
    if let Some(model) = cli.model.clone() {
        config.model = model;
    }

    let mut datasets = Vec::with_capacity(cli.tables.len());
    for path in &cli.tables {
        datasets.push(load_table(path)?);
    }

    let adapter = Arc::new(OpenAiAdapter::from_env(&config)?);
    let mut agent = Agent::new(datasets, config, adapter)?;
    info!("Agent ready (session {})", agent.session_id());

    print_banner(&cli.tables);

    let mut first_turn = true;
    loop {
        print!("\nAsk about your tables: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            println!();
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }
        if input.eq_ignore_ascii_case("new") {
            agent.start_new_conversation();
            first_turn = true;
            println!("Started a fresh conversation.");
            continue;
        }
        if input.eq_ignore_ascii_case("code") {
            match agent.last_code() {
                Some(code) => println!("{code}"),
                None => println!("No program has run yet."),
            }
            continue;
        }

        println!("{}", "─".repeat(80));

        let outcome = if first_turn {
            agent.chat(input).await
        } else {
            agent.follow_up(input).await
        };
        first_turn = false;

        match outcome {
            Ok(response) => print_answer(&response, cli.json),
            Err(failure) => print_failure(&failure, cli.json),
        }

        println!("{}", "─".repeat(80));
    }

    Ok(())
}

fn load_table(path: &Path) -> Result<Dataset> {
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("cannot derive a table name from {}", path.display()))?;

    let dataset = match path.extension().and_then(|ext| ext.to_str()) {
        Some("parquet") => Dataset::from_parquet(&name, path)?,
        _ => Dataset::from_csv(&name, path)?,
    };
    info!(
        "Loaded table '{}' ({} rows x {} columns)",
        dataset.name(),
        dataset.row_count(),
        dataset.column_count()
    );
    Ok(dataset)
}

fn print_banner(tables: &[PathBuf]) {
    println!("\nTable Chat Demo");
    println!("═══════════════════════════════════════════════════════════════");
    println!("Loaded tables:");
    for path in tables {
        println!("   - {}", path.display());
    }
    println!();
    println!("Ask a question in plain language and the agent will answer it");
    println!("with a value, a table, or a chart description.");
    println!("   Examples: \"How many rows are there?\"");
    println!("             \"What is the total amount per customer?\"");
    println!("             \"Plot revenue by month\"");
    println!();
    println!("Commands:");
    println!("   - 'code' shows the last program the agent ran.");
    println!("   - 'new' starts a fresh conversation.");
    println!("   - 'exit' quits.");
    println!("═══════════════════════════════════════════════════════════════");
}

fn print_answer(response: &ChatResponse, as_json: bool) {
    if as_json {
        match serde_json::to_string_pretty(&answer_to_json(&response.answer)) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => println!("Could not serialise the answer: {e}"),
        }
        return;
    }
    println!("{}", response.answer);
}

fn print_failure(failure: &ErrorResponse, as_json: bool) {
    if as_json {
        match serde_json::to_string_pretty(failure) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => println!("Could not serialise the failure: {e}"),
        }
        return;
    }
    println!("The agent could not answer: {failure}");
    if let Some(code) = &failure.last_code_executed {
        println!("Last program attempted:");
        println!("{code}");
    }
}
