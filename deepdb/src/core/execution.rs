//! Query execution results as seen by the SQL refinement loop.
//!
//! Warehouse rejections are ordinary data here: they travel through
//! `query_execution_output` so the review stage can correct the query on the
//! next iteration. Only infrastructure failures become `Err`.

use serde::{Deserialize, Serialize};

/// Structured warehouse error, inspectable by the review stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    /// Coarse classification (e.g. `syntax_error`, `not_found`).
    pub error_type: String,
    pub message: String,
    /// Offending part of the statement, when the warehouse reports a position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
}

/// Tabular query result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryRows {
    /// Render as a GitHub-flavoured markdown table.
    pub fn to_markdown(&self) -> String {
        if self.columns.is_empty() {
            return "(no columns)".to_string();
        }
        let mut out = String::new();
        out.push_str(&format!("| {} |\n", self.columns.join(" | ")));
        out.push_str(&format!(
            "|{}|\n",
            self.columns.iter().map(|_| "---").collect::<Vec<_>>().join("|")
        ));
        for row in &self.rows {
            let cells: Vec<String> = row.iter().map(|cell| escape_cell(cell)).collect();
            out.push_str(&format!("| {} |\n", cells.join(" | ")));
        }
        if self.rows.is_empty() {
            out.push_str("\n(0 rows)\n");
        }
        out
    }
}

fn escape_cell(cell: &str) -> String {
    cell.replace('|', "\\|").replace('\n', " ")
}

/// Outcome of a warehouse `execute_sql` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum QueryResult {
    Success(QueryRows),
    Error(QueryError),
}

/// Structured output of the query execution stage (`query_execution_output`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionReport {
    Success { result_table: String },
    Error { error: QueryError },
}

impl ExecutionReport {
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionReport::Error { .. })
    }

    /// Text form used when the report is substituted into prompts.
    pub fn render(&self) -> String {
        match self {
            ExecutionReport::Success { result_table } => result_table.trim().to_string(),
            ExecutionReport::Error { error } => {
                let mut out = format!(
                    "QUERY FAILED\nerror_type: {}\nmessage: {}",
                    error.error_type, error.message
                );
                if let Some(fragment) = &error.fragment {
                    out.push_str(&format!("\nfragment: {fragment}"));
                }
                out
            }
        }
    }
}

impl From<QueryResult> for ExecutionReport {
    fn from(result: QueryResult) -> Self {
        match result {
            QueryResult::Success(rows) => ExecutionReport::Success {
                result_table: rows.to_markdown(),
            },
            QueryResult::Error(error) => ExecutionReport::Error { error },
        }
    }
}
