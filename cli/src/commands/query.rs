use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use pubdatahub_core::Config;
use pubdatahub_core::DataSource;
use pubdatahub_core::ProgressSender;
use pubdatahub_core::hn::HackerNewsSource;
use pubdatahub_core::jobs::ExportFormat;
use pubdatahub_core::jobs::ExportJob;
use pubdatahub_core::jobs::Job;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::output;

pub async fn run(
    config: &Config,
    source_name: &str,
    sql: &str,
    format: &str,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let hackernews = Arc::new(HackerNewsSource::new(&config.download)?);
    let mut registry = pubdatahub_core::SourceRegistry::new();
    registry.register(Arc::clone(&hackernews) as Arc<dyn DataSource>);
    let source = registry.get(source_name)?;
    source.init_storage(&config.storage_root).await?;

    let result = execute(source, sql, format, file).await;
    hackernews.close().await;
    result
}

async fn execute(
    source: Arc<dyn DataSource>,
    sql: &str,
    format: &str,
    file: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(dest) = file {
        // Large result sets go through the export job, same as the API path.
        let export_format: ExportFormat = match format {
            // A bare `--file x.json` without --output defaults to json.
            "table" => ExportFormat::Json,
            other => other.parse()?,
        };
        let job = ExportJob::new(Arc::clone(&source), sql, export_format, dest.clone());
        job.validate()?;
        let (progress, _updates) = ProgressSender::channel(job.id());
        job.execute(CancellationToken::new(), progress).await?;
        let record = job.progress();
        println!(
            "exported {} row(s) to {}",
            record.total,
            dest.display()
        );
        return Ok(());
    }

    let result = source.query(sql).await?;
    match format {
        "table" => {
            print!("{}", output::table(&result.columns, &result.rows));
            println!(
                "{} row(s) in {} ms",
                result.count,
                result.duration.as_millis()
            );
        }
        "json" => {
            let objects: Vec<serde_json::Map<String, Value>> = result
                .rows
                .iter()
                .map(|row| {
                    result
                        .columns
                        .iter()
                        .cloned()
                        .zip(row.iter().cloned())
                        .collect()
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&objects)?);
        }
        "csv" => {
            let mut writer = csv_writer();
            writer.write_record(&result.columns)?;
            for row in &result.rows {
                let fields: Vec<String> = row.iter().map(csv_field).collect();
                writer.write_record(&fields)?;
            }
            let bytes = writer.into_inner()?;
            print!("{}", String::from_utf8_lossy(&bytes));
        }
        other => bail!("unknown output format: {other} (expected table, json or csv)"),
    }
    Ok(())
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::Writer::from_writer(Vec::new())
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
