use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::bail;
use pubdatahub_core::Config;
use pubdatahub_core::StateStore;
use pubdatahub_protocol::ApplicationState;
use pubdatahub_protocol::JobInfo;

use crate::context;
use crate::output;

/// Fetch the job list from a running `serve` instance, or fall back to the
/// persisted job table when no server is listening.
async fn fetch_jobs(config: &Config) -> anyhow::Result<(Vec<JobInfo>, bool)> {
    let base = context::api_base(config);
    let client = reqwest::Client::new();
    match client.get(format!("{base}/api/jobs")).send().await {
        Ok(response) => {
            let jobs: Vec<JobInfo> = response.json().await.context("decode job list")?;
            Ok((jobs, true))
        }
        Err(_) => {
            let state = StateStore::init(&config.state_root, config.max_backups).await?;
            let app: Option<ApplicationState> = state.load("application").await?;
            let jobs = app
                .map(|app| {
                    app.jobs
                        .into_iter()
                        .map(|record| JobInfo {
                            id: record.id,
                            kind: record.kind,
                            status: record.status,
                            priority: 0,
                            description: record
                                .source
                                .map(|source| format!("download {source}"))
                                .unwrap_or_else(|| record.kind.to_string()),
                            metadata: record.metadata,
                            progress: record.progress,
                            retry_count: 0,
                            max_retries: 0,
                            created_by: None,
                            created_at: record.started_at.unwrap_or_default(),
                            started_at: record.started_at,
                            completed_at: None,
                            error: None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            Ok((jobs, false))
        }
    }
}

pub async fn list(config: &Config) -> anyhow::Result<()> {
    let (jobs, live) = fetch_jobs(config).await?;
    if !live {
        eprintln!("(no server running; showing persisted job state)");
    }
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for info in jobs {
        println!("{}", output::job_line(&info));
    }
    Ok(())
}

pub async fn status(config: &Config, id: &str) -> anyhow::Result<()> {
    let (jobs, live) = fetch_jobs(config).await?;
    if !live {
        eprintln!("(no server running; showing persisted job state)");
    }
    let Some(info) = jobs.iter().find(|info| info.id.to_string() == id) else {
        bail!("no such job: {id}");
    };
    println!("{}", output::job_line(info));
    println!("kind:        {}", info.kind);
    println!("priority:    {}", info.priority);
    println!("retries:     {}/{}", info.retry_count, info.max_retries);
    if let Some(started) = info.started_at {
        println!("started:     {started}");
    }
    if let Some(completed) = info.completed_at {
        println!("completed:   {completed}");
    }
    if let Some(message) = &info.progress.message {
        println!("progress:    {message}");
    }
    Ok(())
}

async fn post_job_action(config: &Config, id: &str, action: &str) -> anyhow::Result<()> {
    let base = context::api_base(config);
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/api/jobs/{id}/{action}"))
        .send()
        .await
        .with_context(|| format!("no server reachable at {base}; start one with `serve`"))?;
    if !response.status().is_success() {
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body["error"].as_str().unwrap_or("unknown error");
        bail!("{action} failed ({status}): {message}");
    }
    println!("job {id}: {action} requested");
    Ok(())
}

pub async fn pause(config: &Config, id: &str) -> anyhow::Result<()> {
    post_job_action(config, id, "pause").await
}

pub async fn resume(config: &Config, id: &str) -> anyhow::Result<()> {
    post_job_action(config, id, "resume").await
}

pub async fn stop(config: &Config, id: &str) -> anyhow::Result<()> {
    post_job_action(config, id, "cancel").await
}

pub async fn stats(config: &Config) -> anyhow::Result<()> {
    let (jobs, live) = fetch_jobs(config).await?;
    if !live {
        eprintln!("(no server running; showing persisted job state)");
    }
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for info in &jobs {
        *by_status.entry(info.status.to_string()).or_default() += 1;
    }
    println!("jobs: {}", jobs.len());
    for (status, count) in by_status {
        println!("  {status:<10} {count}");
    }
    Ok(())
}
