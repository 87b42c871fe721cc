/// Backup job pipeline: pre-hook, stop, capture, restart, post-hook, remote
/// sync. One app's job runs to completion before the next starts; fleet runs
/// aggregate outcomes instead of aborting on the first failure. Containers
/// this job stopped are restarted even when capture fails.
use std::path::Path;

use anyhow::{bail, Result};

use crate::core::capture::CaptureEngine;
use crate::core::config::{AppConfig, GlobalConfig};
use crate::core::discovery::{discover_apps, resolve_location, DiscoveryMode};
use crate::core::docker::ComposeRuntime;
use crate::core::notify::{Notifier, Severity};
use crate::core::remote::ResticRepo;
use crate::core::runner::{run_hook, CommandRunner};
use crate::utils::run_timestamp;

/// Aggregate outcome of a fleet-wide run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct BackupJob<'a> {
    cfg: &'a GlobalConfig,
    runner: &'a dyn CommandRunner,
    notifier: &'a Notifier,
}

impl<'a> BackupJob<'a> {
    pub fn new(cfg: &'a GlobalConfig, runner: &'a dyn CommandRunner, notifier: &'a Notifier) -> Self {
        Self {
            cfg,
            runner,
            notifier,
        }
    }

    /// Back up one app by name. A disabled backup section or a host
    /// allowlist miss is a skip notice, not an error.
    pub async fn backup_app(&self, name: &str) -> Result<()> {
        let app = AppConfig::load(&self.cfg.apps_root, name)?;
        if !app.backup_enabled {
            println!("{} has backup disabled, skipping", name);
            return Ok(());
        }
        if !app.host_allowed(&self.cfg.host_id) {
            println!("{} is not assigned to host {}, skipping", name, self.cfg.host_id);
            return Ok(());
        }

        match self.run_pipeline(&app).await {
            Ok(()) => {
                self.notifier.send(name, Severity::Success, "Backup completed").await;
                Ok(())
            }
            Err(err) => {
                self.notifier
                    .send(name, Severity::Error, &format!("Backup failed: {:#}", err))
                    .await;
                Err(err)
            }
        }
    }

    /// Fleet-wide backup over discovered apps, sequentially.
    pub async fn backup_all(&self) -> Result<RunSummary> {
        let apps = discover_apps(self.cfg, DiscoveryMode::Backup)?;
        if apps.is_empty() {
            println!("no backup-eligible apps under {}", self.cfg.apps_root.display());
            return Ok(RunSummary::default());
        }
        let mut summary = RunSummary::default();
        for app in &apps {
            println!("\nBacking up {}...", app.name);
            match self.backup_app(&app.name).await {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    println!("✗ {}: {:#}", app.name, err);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn run_pipeline(&self, app: &AppConfig) -> Result<()> {
        let location = resolve_location(&self.cfg.apps_root, app);
        if !location.exists() {
            bail!("app directory {} does not exist", location.display());
        }
        let stamp = run_timestamp();

        if let Some(hook) = &app.pre_backup {
            run_hook(self.runner, "pre_backup", hook, &location, self.cfg.timeouts.hook).await;
        }

        let compose = ComposeRuntime::new(self.runner, self.cfg);
        let was_running = compose.stop(app, &location).await?;

        let captured = self.capture_all(app, &location, &stamp).await;

        // Restart comes first no matter how capture went; when both fail,
        // the capture error stays the job outcome.
        if was_running {
            if let Err(err) = compose.start(app, &location).await {
                if captured.is_ok() {
                    return Err(err.context(format!("{} was captured but did not come back up", app.name)));
                }
                println!("✗ {}: restart also failed: {:#}", app.name, err);
            }
        }
        captured?;

        if let Some(hook) = &app.post_backup {
            run_hook(self.runner, "post_backup", hook, &location, self.cfg.timeouts.hook).await;
        }

        self.sync_remote(app).await
    }

    async fn capture_all(&self, app: &AppConfig, location: &Path, stamp: &str) -> Result<()> {
        let capture = CaptureEngine::new(self.runner, self.cfg);
        capture.capture_data(app, location, stamp).await?;
        capture.capture_databases(app, location, stamp).await;
        match capture.prune_stale_artifacts(app, stamp) {
            Ok(0) => {}
            Ok(removed) => println!("  pruned {} stale local artifact(s)", removed),
            Err(err) => println!("⚠ {}: could not prune stale artifacts: {:#}", app.name, err),
        }
        Ok(())
    }

    /// Push the staging directory and apply retention. Without credentials
    /// the backup stays local and the job still succeeds.
    async fn sync_remote(&self, app: &AppConfig) -> Result<()> {
        let repo = match ResticRepo::new(self.runner, self.cfg) {
            Some(repo) => repo,
            None => {
                println!("⚠ {}: remote credentials not configured, keeping backup local only", app.name);
                self.notifier
                    .send(&app.name, Severity::Warning, "Remote sync skipped: credentials not configured")
                    .await;
                return Ok(());
            }
        };
        repo.ensure_initialized().await?;
        repo.clear_stale_locks().await;
        repo.push(&app.name, &self.cfg.backup_root.join(&app.name)).await?;
        println!("  ✓ {} synced to {}", app.name, repo.repository());
        if let Err(err) = repo.apply_retention(&app.name).await {
            println!("⚠ {}: retention pruning failed: {:#}", app.name, err);
        }
        Ok(())
    }
}
