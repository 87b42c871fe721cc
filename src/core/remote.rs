/// Remote snapshot repository: restic over Backblaze B2.
///
/// The repository is addressed deterministically as `b2:<bucket>:<host_id>`,
/// so every host owns its own namespace inside the shared bucket.
/// Credentials travel on each child's environment and never through the
/// parent process environment.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::config::{GlobalConfig, RemoteConfig, Timeouts};
use crate::core::runner::{run_checked, CommandRunner, CommandSpec};
use crate::utils::{FLEET_TAG, KEEP_DAILY, KEEP_MONTHLY, KEEP_WEEKLY};

/// One snapshot as reported by `restic snapshots --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Snapshot {
    pub fn display_id(&self) -> &str {
        if self.short_id.is_empty() {
            &self.id
        } else {
            &self.short_id
        }
    }
}

pub struct ResticRepo<'a> {
    runner: &'a dyn CommandRunner,
    remote: &'a RemoteConfig,
    timeouts: &'a Timeouts,
    host_id: &'a str,
    repository: String,
}

impl<'a> ResticRepo<'a> {
    /// Returns None when remote credentials are not fully configured;
    /// callers decide whether that is a skip or a hard precondition.
    pub fn new(runner: &'a dyn CommandRunner, cfg: &'a GlobalConfig) -> Option<Self> {
        let remote = cfg.remote.as_ref()?;
        Some(Self {
            runner,
            remote,
            timeouts: &cfg.timeouts,
            host_id: &cfg.host_id,
            repository: format!("b2:{}:{}", remote.bucket, cfg.host_id),
        })
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn spec(&self, timeout: Duration, args: &[&str]) -> CommandSpec {
        CommandSpec::new("restic", timeout)
            .args(args.iter().copied())
            .env("RESTIC_REPOSITORY", self.repository.as_str())
            .env("RESTIC_PASSWORD", self.remote.password.as_str())
            .env("B2_ACCOUNT_ID", self.remote.account_id.as_str())
            .env("B2_ACCOUNT_KEY", self.remote.account_key.as_str())
    }

    /// Probe the repository and initialize it when unreachable.
    /// Initialization failure is fatal to the enclosing job.
    pub async fn ensure_initialized(&self) -> Result<()> {
        let probe = self.spec(self.timeouts.remote_probe, &["cat", "config"]);
        let reachable = self.runner.run(probe).await.map(|o| o.success()).unwrap_or(false);
        if reachable {
            return Ok(());
        }
        println!("  repository {} not reachable, initializing", self.repository);
        run_checked(self.runner, self.spec(self.timeouts.sync, &["init"]))
            .await
            .context("repository initialization failed")?;
        Ok(())
    }

    /// Clear stale locks left behind by an aborted run. Best-effort.
    pub async fn clear_stale_locks(&self) {
        let spec = self.spec(self.timeouts.remote_probe, &["unlock"]);
        if let Err(err) = run_checked(self.runner, spec).await {
            println!("⚠ could not clear repository locks: {}", err);
        }
    }

    /// Push one app's staging directory as a snapshot tagged with the app
    /// name and the fleet tag.
    pub async fn push(&self, app: &str, dir: &Path) -> Result<()> {
        let dir_arg = dir.display().to_string();
        let spec = self.spec(
            self.timeouts.sync,
            &[
                "backup",
                dir_arg.as_str(),
                "--tag",
                app,
                "--tag",
                FLEET_TAG,
                "--host",
                self.host_id,
            ],
        );
        run_checked(self.runner, spec)
            .await
            .with_context(|| format!("restic push failed for {}", app))?;
        Ok(())
    }

    /// Time-bucketed retention scoped to the app's tag. The caller treats a
    /// failure here as non-fatal: the push has already happened.
    pub async fn apply_retention(&self, app: &str) -> Result<()> {
        let daily = KEEP_DAILY.to_string();
        let weekly = KEEP_WEEKLY.to_string();
        let monthly = KEEP_MONTHLY.to_string();
        let spec = self.spec(
            self.timeouts.sync,
            &[
                "forget",
                "--tag",
                app,
                "--keep-daily",
                daily.as_str(),
                "--keep-weekly",
                weekly.as_str(),
                "--keep-monthly",
                monthly.as_str(),
                "--prune",
            ],
        );
        run_checked(self.runner, spec)
            .await
            .with_context(|| format!("retention pruning failed for {}", app))?;
        Ok(())
    }

    /// All snapshots carrying the app's tag, oldest first.
    pub async fn snapshots(&self, app: &str) -> Result<Vec<Snapshot>> {
        let spec = self.spec(self.timeouts.remote_probe, &["snapshots", "--tag", app, "--json"]);
        let output = run_checked(self.runner, spec)
            .await
            .context("failed to list snapshots")?;
        let trimmed = output.stdout.trim();
        if trimmed.is_empty() || trimmed == "null" {
            return Ok(Vec::new());
        }
        let mut snaps: Vec<Snapshot> =
            serde_json::from_str(trimmed).context("unexpected snapshot listing format")?;
        snaps.sort_by_key(|s| s.time);
        Ok(snaps)
    }

    /// Latest snapshot for the app, by snapshot timestamp.
    pub async fn latest(&self, app: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots(app).await?.into_iter().max_by_key(|s| s.time))
    }

    /// Fetch one app's path namespace out of a snapshot into `target`.
    pub async fn fetch(&self, reference: &str, include: &Path, target: &Path) -> Result<()> {
        let include_arg = include.display().to_string();
        let target_arg = target.display().to_string();
        let spec = self.spec(
            self.timeouts.fetch,
            &[
                "restore",
                reference,
                "--target",
                target_arg.as_str(),
                "--include",
                include_arg.as_str(),
            ],
        );
        run_checked(self.runner, spec)
            .await
            .with_context(|| format!("failed to fetch snapshot {}", reference))?;
        Ok(())
    }
}
