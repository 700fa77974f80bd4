use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use pubdatahub_core::Config;

pub fn show(config: &Config) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config).context("encode config")?;
    print!("{rendered}");
    Ok(())
}

pub fn validate(config: &Config) -> anyhow::Result<()> {
    config.validate()?;
    println!("configuration is valid");
    Ok(())
}

pub fn set_storage(
    mut config: Config,
    config_path: Option<&Path>,
    storage_root: PathBuf,
) -> anyhow::Result<()> {
    config.storage_root = storage_root;
    config.validate()?;
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.config_path());
    config.save(&path)?;
    println!("storage root set to {}", config.storage_root.display());
    println!("saved {}", path.display());
    Ok(())
}
