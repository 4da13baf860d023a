use std::path::Path;

use anyhow::Context as _;
use log::{debug, info};

use crate::config::Config;
use crate::config::ProxyRole;

fn ensure_directory(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory `{}`", path.display()))?;

    let mdata = std::fs::metadata(path)
        .with_context(|| format!("Failed to inspect directory `{}`", path.display()))?;
    if mdata.permissions().readonly() {
        anyhow::bail!("Directory `{}` is not writable", path.display());
    }

    debug!("Using directory `{}`", path.display());
    Ok(())
}

/// Removes temporary package files left behind by an interrupted run.
fn remove_stale_packages(path: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    let mut pending = vec![path.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory `{}`", dir.display()))?
        {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                pending.push(entry_path);
            } else if entry_path.extension().is_some_and(|ext| ext != "gzip") {
                debug!("Removing stale file `{}`", entry_path.display());
                std::fs::remove_file(&entry_path).with_context(|| {
                    format!("Failed to remove entry `{}`", entry_path.display())
                })?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}

pub(crate) fn task_setup(config: &Config) -> anyhow::Result<()> {
    ensure_directory(&config.cache_directory)?;
    ensure_directory(&config.log_directory)?;

    if config.role == ProxyRole::Remote {
        ensure_directory(&config.packages_directory)?;

        let removed = remove_stale_packages(&config.packages_directory).with_context(|| {
            format!(
                "Failed to clean up packages directory `{}`",
                config.packages_directory.display()
            )
        })?;
        if removed > 0 {
            info!("Removed {removed} stale temporary package files");
        }
    }

    Ok(())
}
