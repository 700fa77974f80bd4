use std::io::Write;
use std::sync::Arc;

use anyhow::bail;
use pubdatahub_core::Config;
use pubdatahub_core::jobs::DownloadJob;
use pubdatahub_protocol::JobStatus;

use crate::context;

/// Run one download in-process with live progress. Interrupting pauses the
/// job (persisting it) instead of losing the run.
pub async fn run(
    mut config: Config,
    source_name: &str,
    batch_size: Option<i64>,
    resume: bool,
) -> anyhow::Result<()> {
    if let Some(batch_size) = batch_size {
        config.download.batch_size = batch_size;
        config.validate()?;
    }
    let handles = context::build(config).await?;
    context::record_invocation(
        &handles.state,
        format!("download {source_name}{}", if resume { " --resume" } else { "" }),
    )
    .await;

    let source = handles.registry.get(source_name)?;
    source.init_storage(&handles.config.storage_root).await?;

    let job = Arc::new(DownloadJob::new(Arc::clone(&source), 0));
    let id = handles.manager.submit(job)?;
    let mut updates = handles.manager.subscribe();
    println!("download job {id} submitted ({} mode)", if resume { "resume" } else { "fresh" });

    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("\ninterrupt received, pausing download...");
                if let Err(err) = handles.manager.pause(id).await {
                    eprintln!("pause failed: {err}");
                }
            }
            update = updates.recv() => {
                if let Ok(event) = update
                    && event.job_id == id
                {
                    let record = event.record;
                    let message = record.message.as_deref().unwrap_or("");
                    print!("\r[{}/{}] {message:<60}", record.current, record.total);
                    let _ = std::io::stdout().flush();
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
        }

        let info = handles.manager.get(id)?;
        match info.status {
            JobStatus::Completed => {
                println!("\ndownload complete");
                break;
            }
            JobStatus::Paused => {
                println!("\ndownload paused; run `download {source_name} --resume` to continue");
                break;
            }
            JobStatus::Failed => {
                let _ = handles.manager.stop().await;
                handles.hackernews.close().await;
                bail!(
                    "download failed: {}",
                    info.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            JobStatus::Cancelled => {
                println!("\ndownload cancelled");
                break;
            }
            JobStatus::Queued | JobStatus::Running => {}
        }
    }

    let _ = handles.manager.stop().await;
    handles.hackernews.close().await;
    Ok(())
}
