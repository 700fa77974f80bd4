use pubdatahub_core::Config;
use pubdatahub_core::SourceRegistry;
use pubdatahub_core::hn::HackerNewsSource;
use std::sync::Arc;

fn registry(config: &Config) -> anyhow::Result<(SourceRegistry, Arc<HackerNewsSource>)> {
    let hackernews = Arc::new(HackerNewsSource::new(&config.download)?);
    let mut registry = SourceRegistry::new();
    registry.register(Arc::clone(&hackernews) as Arc<dyn pubdatahub_core::DataSource>);
    Ok((registry, hackernews))
}

pub async fn list(config: &Config) -> anyhow::Result<()> {
    let (registry, hackernews) = registry(config)?;
    for info in registry.list() {
        println!("{:<16} {}", info.name, info.description);
    }
    hackernews.close().await;
    Ok(())
}

pub async fn status(config: &Config, name: &str) -> anyhow::Result<()> {
    let (registry, hackernews) = registry(config)?;
    let source = registry.get(name)?;
    source.init_storage(&config.storage_root).await?;
    let status = source.download_status().await;

    println!("source:       {name}");
    if let Some(path) = source.storage_path() {
        println!("storage:      {}", path.display());
    }
    println!("state:        {}", status.state);
    println!("items cached: {}", status.items_cached);
    println!("items total:  {}", status.items_total);
    if status.items_total > 0 {
        println!("progress:     {:.1}%", status.progress * 100.0);
    }
    if let Some(updated) = status.last_update {
        println!("last update:  {updated}");
    }
    if let Some(error) = &status.error_message {
        println!("last error:   {error}");
    }

    let schema = source.schema().await?;
    if !schema.is_empty() {
        println!("tables:");
        for table in schema {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|column| format!("{} {}", column.name, column.type_tag))
                .collect();
            println!("  {} ({})", table.table, columns.join(", "));
        }
    }
    hackernews.close().await;
    Ok(())
}
