use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::models::Task;

pub const NO_TASKS_MESSAGE: &str =
    "Oops, the project does not have tasks to export, if you are the owner add some tasks";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// Tasks as a JSON array of task dictionaries.
pub fn tasks_to_json(tasks: &[Task]) -> Result<Value> {
    serde_json::to_value(tasks).context("Failed to serialize tasks")
}

/// Tasks as CSV. Every top-level task field becomes a `task__{field}` column
/// and every `info` key seen in any task becomes a `taskinfo__{key}` column.
/// Columns are sorted; cells a task has no value for are left empty.
pub fn tasks_to_csv(tasks: &[Task]) -> Result<String> {
    let rows: Vec<Map<String, Value>> = tasks
        .iter()
        .map(flatten_task)
        .collect::<Result<_>>()?;
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&columns)
        .context("Failed to write CSV header")?;
    for row in &rows {
        let record: Vec<String> = columns
            .iter()
            .map(|column| row.get(*column).map(cell_text).unwrap_or_default())
            .collect();
        writer
            .write_record(&record)
            .context("Failed to write CSV record")?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

fn flatten_task(task: &Task) -> Result<Map<String, Value>> {
    let Value::Object(fields) = serde_json::to_value(task).context("Failed to serialize task")?
    else {
        anyhow::bail!("Task did not serialize to an object");
    };
    let mut flat = Map::new();
    for (key, value) in fields {
        flat.insert(format!("task__{}", key), value);
    }
    for (key, value) in &task.info {
        flat.insert(format!("taskinfo__{}", key), value.clone());
    }
    Ok(flat)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
