/// Application discovery and location resolution.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::config::{AppConfig, GlobalConfig};
use crate::utils::COMPOSE_FILE_NAMES;

/// What an eligibility scan is for. Backup discovery additionally requires
/// `backup.enabled`; restore discovery takes every configured app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    Backup,
    Restore,
}

#[derive(Debug, Clone)]
pub struct DiscoveredApp {
    pub name: String,
    pub config: AppConfig,
    pub location: PathBuf,
}

/// Enumerate eligible applications under the apps root, lexicographically
/// sorted. Idempotent; the only side effects are skip notices on stdout.
pub fn discover_apps(cfg: &GlobalConfig, mode: DiscoveryMode) -> Result<Vec<DiscoveredApp>> {
    let entries = std::fs::read_dir(&cfg.apps_root)
        .with_context(|| format!("apps root {} is not readable", cfg.apps_root.display()))?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort();
    names.dedup();

    let mut apps = Vec::new();
    for name in names {
        if AppConfig::document_path(&cfg.apps_root, &name).is_none() {
            continue; // unmanaged directory
        }
        let config = match AppConfig::load(&cfg.apps_root, &name) {
            Ok(config) => config,
            Err(err) => {
                println!("⚠ skipping {}: {:#}", name, err);
                continue;
            }
        };
        let location = resolve_location(&cfg.apps_root, &config);
        if find_compose_file(&location).is_none() {
            println!(
                "⚠ skipping {}: no compose descriptor in {}",
                name,
                location.display()
            );
            continue;
        }
        if mode == DiscoveryMode::Backup && !config.backup_enabled {
            continue;
        }
        if !config.host_allowed(&cfg.host_id) {
            println!(
                "skipping {}: host {} not in allowed_hosts",
                name, cfg.host_id
            );
            continue;
        }
        apps.push(DiscoveredApp {
            name,
            config,
            location,
        });
    }
    Ok(apps)
}

/// Resolve the on-disk directory for an app: the `install_path` override when
/// it exists, else the target of an `apps_root/<name>` symlink, else
/// `apps_root/<name>` itself. Computed fresh for every operation; symlinks
/// may be repointed between runs.
pub fn resolve_location(apps_root: &Path, config: &AppConfig) -> PathBuf {
    if let Some(install) = &config.install_path {
        if install.exists() {
            return install.clone();
        }
    }
    let default = apps_root.join(&config.name);
    if default.is_symlink() {
        if let Ok(resolved) = std::fs::canonicalize(&default) {
            return resolved;
        }
    }
    default
}

/// First compose descriptor present at the location, in canonical name order.
pub fn find_compose_file(location: &Path) -> Option<PathBuf> {
    COMPOSE_FILE_NAMES
        .iter()
        .map(|f| location.join(f))
        .find(|p| p.is_file())
}
