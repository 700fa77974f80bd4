use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobKind;
use pubdatahub_protocol::ProgressRecord;
use pubdatahub_protocol::QueryOutput;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::CoreError;
use crate::DataSource;
use crate::Result;
use crate::jobs::Job;
use crate::jobs::PriorityCell;
use crate::jobs::ProgressSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(CoreError::validation(format!(
                "unknown export format: {other} (expected json or csv)"
            ))),
        }
    }
}

/// Runs one query against a source and writes the rows to a file.
///
/// Not pausable: the result set is computed in one shot and a partial export
/// file is worthless.
pub struct ExportJob {
    id: JobId,
    priority: PriorityCell,
    source: Arc<dyn DataSource>,
    sql: String,
    format: ExportFormat,
    dest: PathBuf,
    progress: StdMutex<ProgressRecord>,
}

impl ExportJob {
    pub fn new(
        source: Arc<dyn DataSource>,
        sql: impl Into<String>,
        format: ExportFormat,
        dest: impl Into<PathBuf>,
    ) -> Self {
        Self::with_id(JobId::new(), source, sql, format, dest)
    }

    pub fn with_id(
        id: JobId,
        source: Arc<dyn DataSource>,
        sql: impl Into<String>,
        format: ExportFormat,
        dest: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            priority: PriorityCell::new(0),
            source,
            sql: sql.into(),
            format,
            dest: dest.into(),
            progress: StdMutex::new(ProgressRecord::default()),
        }
    }
}

#[async_trait]
impl Job for ExportJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn kind(&self) -> JobKind {
        JobKind::Export
    }

    fn priority(&self) -> i32 {
        self.priority.get()
    }

    fn set_priority(&self, priority: i32) {
        self.priority.set(priority);
    }

    fn description(&self) -> String {
        format!("export {} query to {}", self.source.name(), self.dest.display())
    }

    fn metadata(&self) -> serde_json::Map<String, Value> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".to_string(), Value::from(self.source.name()));
        metadata.insert("dest".to_string(), Value::from(self.dest.display().to_string()));
        metadata
    }

    fn progress(&self) -> ProgressRecord {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn validate(&self) -> Result<()> {
        if self.sql.trim().is_empty() {
            return Err(CoreError::validation("export query must not be empty"));
        }
        if self.dest.as_os_str().is_empty() {
            return Err(CoreError::validation("export destination must not be empty"));
        }
        Ok(())
    }

    async fn execute(&self, cancel: CancellationToken, progress: ProgressSender) -> Result<()> {
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Canceled),
            output = self.source.query(&self.sql) => output?,
        };
        let total = output.rows.len() as u64;
        progress.send(ProgressRecord::with_message(0, total, "writing export"));

        let encoded = match self.format {
            ExportFormat::Json => encode_json(&output)?,
            ExportFormat::Csv => encode_csv(&output)?,
        };
        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.dest, encoded).await?;

        let record = ProgressRecord::with_message(
            total,
            total,
            format!("wrote {} row(s) to {}", total, self.dest.display()),
        );
        *self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = record.clone();
        progress.send(record);
        Ok(())
    }
}

fn encode_json(output: &QueryOutput) -> Result<Vec<u8>> {
    let objects: Vec<serde_json::Map<String, Value>> = output
        .rows
        .iter()
        .map(|row| {
            output
                .columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&objects)?)
}

fn encode_csv(output: &QueryOutput) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&output.columns)
        .map_err(|err| CoreError::validation(format!("csv encode: {err}")))?;
    for row in &output.rows {
        let fields: Vec<String> = row.iter().map(value_to_field).collect();
        writer
            .write_record(&fields)
            .map_err(|err| CoreError::validation(format!("csv encode: {err}")))?;
    }
    writer
        .into_inner()
        .map_err(|err| CoreError::validation(format!("csv encode: {err}")))
}

fn value_to_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn export_format_parses_case_insensitively() {
        assert_eq!("CSV".parse::<ExportFormat>().expect("csv"), ExportFormat::Csv);
        assert_eq!("json".parse::<ExportFormat>().expect("json"), ExportFormat::Json);
        assert!("parquet".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn csv_encoding_flattens_values() {
        let output = QueryOutput {
            columns: vec!["id".to_string(), "title".to_string()],
            rows: vec![vec![Value::from(1), Value::from("a,b")]],
            count: 1,
            duration: std::time::Duration::ZERO,
        };
        let bytes = encode_csv(&output).expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert_eq!(text, "id,title\n1,\"a,b\"\n");
    }
}
