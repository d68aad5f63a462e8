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

//! Builds the text sent to the completion provider: one system prompt
//! describing the analysis language and the session's datasets, plus the
//! per-turn instructions. Every instruction carries the user's question;
//! corrections additionally embed the failing code and its diagnostic
//! verbatim so the model sees exactly what the executor saw.

use std::fmt::Write;

use crate::agent::TrainingExample;
use crate::config::AgentConfig;
use crate::dataset::{describe_for_prompt, Dataset};
use crate::response::OutputKind;

pub struct PromptBuilder<'a> {
    config: &'a AgentConfig,
    datasets: &'a [Dataset],
}

impl<'a> PromptBuilder<'a> {
    pub fn new(config: &'a AgentConfig, datasets: &'a [Dataset]) -> Self {
        Self { config, datasets }
    }

    pub fn system_prompt(&self) -> String {
        let mut tables = String::new();
        for dataset in self.datasets {
            let _ = writeln!(tables, "{}", describe_for_prompt(dataset));
        }
        let imports = self.config.allowed_imports.join(", ");
        format!(
            r#"You are a data analyst. You answer questions about the tables below by writing a short program in the analysis language described here. Your ONLY output must be the program text; no explanations, no markdown fences.

Language rules:
- One statement per line. Statements are `import <module>`, `name = <expression>`, `fn name(args) {{ ... }}`, or a bare expression.
- Importable modules: {imports}. Import a module before using its functions.
- Base functions (always available): len(x), str(x), num(x), round(x, digits), abs(x), columns(table), frame({{"col": [values]}}).
- frames module: head(table, n), tail(table, n), sort(table, column, descending), select(table, [columns]), row_count(table).
- stats module: sum(table, column), mean(table, column), min(table, column), max(table, column), median(table, column). Each also accepts a plain list.
- charts module: plot(kind, table, x_column, y_column) where kind is one of "bar", "line", "scatter", "pie".
- execute_sql_query("SELECT ...") runs one SELECT statement against the tables below. Reference tables only by the names shown; never invent table or column names.
- The last statement must assign the answer: result = {{"type": "<kind>", "value": <answer>}} where <kind> is one of "string", "number", "dataframe", "plot".

Tables:
{tables}"#
        )
    }

    pub fn question_instruction(
        &self,
        question: &str,
        expected: Option<OutputKind>,
        examples: &[TrainingExample],
    ) -> String {
        let mut instruction = String::new();
        if !examples.is_empty() {
            instruction.push_str("Previously answered questions for reference:\n");
            for example in examples {
                let _ = writeln!(
                    instruction,
                    "<example>\nQ: {}\nProgram:\n{}\n</example>",
                    example.question,
                    example.code.trim_end()
                );
            }
            instruction.push('\n');
        }
        instruction.push_str(question);
        if let Some(kind) = expected {
            let _ = write!(
                instruction,
                "\n\nReply with a program whose result has type \"{}\".",
                kind.as_str()
            );
        }
        instruction
    }

    /// "Fix this error" framing. The diagnostic is embedded untouched.
    pub fn fix_error_instruction(&self, question: &str, code: &str, diagnostic: &str) -> String {
        format!(
            r#"The program below was written to answer: {question}
It failed. Fix it and reply with the full corrected program only.

<program>
{code}
</program>

<error>
{diagnostic}
</error>"#
        )
    }

    /// "Fix the output type" framing for result-shape mismatches.
    pub fn fix_output_type_instruction(
        &self,
        question: &str,
        code: &str,
        expected: OutputKind,
    ) -> String {
        format!(
            r#"The program below was written to answer: {question}
It ran but declared the wrong result type. Reply with the full corrected program whose result map has type "{}".

<program>
{code}
</program>"#,
            expected.as_str()
        )
    }
}
