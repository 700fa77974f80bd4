use owo_colors::OwoColorize;
use pubdatahub_protocol::JobInfo;
use pubdatahub_protocol::JobStatus;
use serde_json::Value;

/// Render rows as a padded text table.
pub fn table(columns: &[String], rows: &[Vec<Value>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(String::len).collect();
    let rendered: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(cell).collect::<Vec<_>>())
        .collect();
    for row in &rendered {
        for (index, cell) in row.iter().enumerate() {
            if index < widths.len() {
                widths[index] = widths[index].max(cell.len());
            }
        }
    }
    let mut out = String::new();
    for (index, column) in columns.iter().enumerate() {
        let width = widths[index];
        out.push_str(&format!("{column:<width$}  "));
    }
    out.push('\n');
    for width in widths.iter().take(columns.len()) {
        out.push_str(&"-".repeat(*width));
        out.push_str("  ");
    }
    out.push('\n');
    for row in rendered {
        for (index, cell) in row.iter().enumerate() {
            let width = widths.get(index).copied().unwrap_or(0);
            out.push_str(&format!("{cell:<width$}  "));
        }
        out.push('\n');
    }
    out
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => {
            // Keep the table readable for long bodies.
            let mut text = text.replace('\n', " ");
            if text.len() > 60 {
                text.truncate(57);
                text.push_str("...");
            }
            text
        }
        other => other.to_string(),
    }
}

pub fn job_line(info: &JobInfo) -> String {
    let status = colored_status(info.status);
    let progress = if info.progress.total > 0 {
        format!(
            " {}/{} ({:.0}%)",
            info.progress.current,
            info.progress.total,
            info.progress.ratio() * 100.0
        )
    } else {
        String::new()
    };
    let error = info
        .error
        .as_deref()
        .map(|err| format!(" error: {err}"))
        .unwrap_or_default();
    format!("{} {status} {}{progress}{error}", info.id, info.description)
}

fn colored_status(status: JobStatus) -> String {
    let text = status.to_string();
    match status {
        JobStatus::Completed => text.green().to_string(),
        JobStatus::Failed => text.red().to_string(),
        JobStatus::Running => text.cyan().to_string(),
        JobStatus::Paused => text.yellow().to_string(),
        JobStatus::Queued | JobStatus::Cancelled => text.dimmed().to_string(),
    }
}
