//! Warehouse tools a model may call during a stage.
//!
//! Tools are dispatched by name with the arguments the model supplied. Bad
//! arguments and warehouse rejections are reported back to the model as a
//! [`ToolReply::Error`]; only infrastructure failures abort the stage.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::core::execution::{ExecutionReport, QueryError, QueryResult};
use crate::core::sql::write_statement_keyword;
use crate::io::warehouse::Warehouse;

/// What a tool hands back to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolReply {
    Ok(Value),
    Error(String),
}

/// Name and description advertised to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    /// Example of the `arguments` object.
    pub arguments: &'static str,
}

/// A callable tool.
pub trait Tool {
    fn spec(&self) -> ToolSpec;
    fn call(&self, arguments: &Value) -> Result<ToolReply>;
}

/// Fixed set of tools bound to one stage.
pub struct ToolBox<'w> {
    tools: Vec<Box<dyn Tool + 'w>>,
}

impl<'w> ToolBox<'w> {
    /// Metadata lookups plus `execute_sql`.
    pub fn full(warehouse: &'w dyn Warehouse) -> Self {
        let mut tools = Self::metadata(warehouse);
        tools.tools.push(Box::new(ExecuteSql { warehouse }));
        tools
    }

    /// Dataset and table lookups only; no statement execution.
    pub fn metadata(warehouse: &'w dyn Warehouse) -> Self {
        Self {
            tools: vec![
                Box::new(ListDatasetIds { warehouse }),
                Box::new(GetDatasetInfo { warehouse }),
                Box::new(ListTableIds { warehouse }),
                Box::new(GetTableInfo { warehouse }),
            ],
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|tool| tool.spec()).collect()
    }

    /// Dispatch a call by name. Unknown names are a tool error, not a failure.
    #[instrument(skip_all, fields(tool = %name))]
    pub fn dispatch(&self, name: &str, arguments: &Value) -> Result<ToolReply> {
        let Some(tool) = self.tools.iter().find(|tool| tool.spec().name == name) else {
            let known: Vec<&str> = self.tools.iter().map(|tool| tool.spec().name).collect();
            debug!("unknown tool requested");
            return Ok(ToolReply::Error(format!(
                "unknown tool {name:?}; available tools: {}",
                known.join(", ")
            )));
        };
        let reply = tool.call(arguments)?;
        if let ToolReply::Error(message) = &reply {
            debug!(error = %message, "tool reported an error");
        }
        Ok(reply)
    }
}

fn string_argument<'a>(arguments: &'a Value, name: &str) -> Option<&'a str> {
    arguments
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

struct ListDatasetIds<'w> {
    warehouse: &'w dyn Warehouse,
}

impl Tool for ListDatasetIds<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_dataset_ids",
            description: "List the dataset ids in the configured project.",
            arguments: "{}",
        }
    }

    fn call(&self, _arguments: &Value) -> Result<ToolReply> {
        let ids = self.warehouse.list_dataset_ids()?;
        Ok(ToolReply::Ok(json!(ids)))
    }
}

struct GetDatasetInfo<'w> {
    warehouse: &'w dyn Warehouse,
}

impl Tool for GetDatasetInfo<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_dataset_info",
            description: "Description, location and labels of one dataset in the configured project.",
            arguments: r#"{"dataset_id": "sales"}"#,
        }
    }

    fn call(&self, arguments: &Value) -> Result<ToolReply> {
        let Some(dataset_id) = string_argument(arguments, "dataset_id") else {
            return Ok(ToolReply::Error(
                "missing string argument `dataset_id`".to_string(),
            ));
        };
        Ok(match self.warehouse.get_dataset_info(dataset_id)? {
            Some(info) => ToolReply::Ok(info),
            None => ToolReply::Error(format!("dataset {dataset_id:?} not found")),
        })
    }
}

struct ListTableIds<'w> {
    warehouse: &'w dyn Warehouse,
}

impl Tool for ListTableIds<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_table_ids",
            description: "List the table ids in the configured dataset.",
            arguments: "{}",
        }
    }

    fn call(&self, _arguments: &Value) -> Result<ToolReply> {
        let ids = self.warehouse.list_table_ids()?;
        Ok(ToolReply::Ok(json!(ids)))
    }
}

struct GetTableInfo<'w> {
    warehouse: &'w dyn Warehouse,
}

impl Tool for GetTableInfo<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_table_info",
            description: "Schema, description and row count of one table in the configured dataset.",
            arguments: r#"{"table_id": "orders"}"#,
        }
    }

    fn call(&self, arguments: &Value) -> Result<ToolReply> {
        let Some(table_id) = string_argument(arguments, "table_id") else {
            return Ok(ToolReply::Error(
                "missing string argument `table_id`".to_string(),
            ));
        };
        Ok(match self.warehouse.get_table_info(table_id)? {
            Some(info) => ToolReply::Ok(info),
            None => ToolReply::Error(format!("table {table_id:?} not found")),
        })
    }
}

struct ExecuteSql<'w> {
    warehouse: &'w dyn Warehouse,
}

impl Tool for ExecuteSql<'_> {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "execute_sql",
            description: "Run one read-only GoogleSQL statement. Returns a result table or a structured error.",
            arguments: r#"{"sql": "SELECT 1"}"#,
        }
    }

    fn call(&self, arguments: &Value) -> Result<ToolReply> {
        let Some(sql) = string_argument(arguments, "sql") else {
            return Ok(ToolReply::Error("missing string argument `sql`".to_string()));
        };
        let result = match write_statement_keyword(sql) {
            Some(keyword) => {
                info!(keyword = %keyword, "blocked write statement");
                QueryResult::Error(QueryError {
                    error_type: "write_blocked".to_string(),
                    message: format!("{keyword} statements are not allowed; only read queries run"),
                    fragment: Some(keyword),
                })
            }
            None => self.warehouse.execute_sql(sql)?,
        };
        let report = ExecutionReport::from(result);
        Ok(ToolReply::Ok(serde_json::to_value(report)?))
    }
}
