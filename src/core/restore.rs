/// Restore orchestration with crash-safe rollback.
///
/// A restore is a fixed phase sequence: resolve the snapshot reference, stop
/// containers (unless data-only), run the pre-restore hook, fetch the app's
/// namespace into a process-unique staging directory, swap the app directory
/// through an explicit rollback handle, stage any database dumps for manual
/// restoration, run the post-restore hook, start containers, and only then
/// commit the swap. A failed extraction puts the original directory back
/// byte-for-byte; a crash in between leaves the pre-restore copy on disk for
/// the operator.
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use walkdir::WalkDir;

use crate::core::backup::RunSummary;
use crate::core::config::{AppConfig, GlobalConfig};
use crate::core::discovery::{discover_apps, resolve_location, DiscoveredApp, DiscoveryMode};
use crate::core::docker::ComposeRuntime;
use crate::core::notify::{Notifier, Severity};
use crate::core::remote::ResticRepo;
use crate::core::runner::{run_checked, run_hook, CommandRunner, CommandSpec};
use crate::utils::{is_data_archive, is_db_dump, run_timestamp, CONFIG_FILE_NAMES};

/// How a restore run was requested.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Snapshot reference. `latest` resolves to the newest snapshot tagged
    /// with the app; anything else is passed to the repository verbatim.
    pub reference: String,
    /// Touch only on-disk state; skip container stop and start.
    pub data_only: bool,
}

/// Pending-rollback handle for the swap of an app directory. The caller
/// decides the outcome explicitly: [`rollback`] restores the pre-restore
/// state, [`commit`] discards it. If neither runs, the aside copy survives
/// on disk.
///
/// [`rollback`]: RollbackGuard::rollback
/// [`commit`]: RollbackGuard::commit
#[derive(Debug)]
pub struct RollbackGuard {
    original: PathBuf,
    aside: Option<PathBuf>,
}

impl RollbackGuard {
    /// Rename the current directory aside (when present) ahead of an
    /// extraction into its place.
    pub fn stage(original: &Path, stamp: &str) -> Result<Self> {
        let aside = if original.exists() {
            let name = original
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("{} has no usable directory name", original.display()))?;
            let parent = original
                .parent()
                .ok_or_else(|| anyhow!("{} has no parent directory", original.display()))?;
            let aside = parent.join(format!("{}.pre-restore-{}", name, stamp));
            std::fs::rename(original, &aside)
                .with_context(|| format!("failed to move {} aside", original.display()))?;
            Some(aside)
        } else {
            None
        };
        Ok(Self {
            original: original.to_path_buf(),
            aside,
        })
    }

    pub fn aside(&self) -> Option<&Path> {
        self.aside.as_deref()
    }

    /// Undo: drop whatever was extracted and put the original back.
    pub fn rollback(self) -> Result<()> {
        if self.original.exists() {
            std::fs::remove_dir_all(&self.original).with_context(|| {
                format!("failed to remove partial state at {}", self.original.display())
            })?;
        }
        if let Some(aside) = &self.aside {
            std::fs::rename(aside, &self.original)
                .with_context(|| format!("failed to move {} back", aside.display()))?;
        }
        Ok(())
    }

    /// Commit: the new state is good, delete the pre-restore copy.
    pub fn commit(self) -> Result<()> {
        if let Some(aside) = &self.aside {
            std::fs::remove_dir_all(aside).with_context(|| {
                format!("failed to remove pre-restore copy {}", aside.display())
            })?;
        }
        Ok(())
    }
}

/// Ascending priority; equal priorities keep discovery (lexicographic)
/// order since the sort is stable.
pub fn restore_order(mut apps: Vec<DiscoveredApp>) -> Vec<DiscoveredApp> {
    apps.sort_by_key(|app| app.config.restore_priority);
    apps
}

pub struct RestoreOrchestrator<'a> {
    cfg: &'a GlobalConfig,
    runner: &'a dyn CommandRunner,
    notifier: &'a Notifier,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(cfg: &'a GlobalConfig, runner: &'a dyn CommandRunner, notifier: &'a Notifier) -> Self {
        Self {
            cfg,
            runner,
            notifier,
        }
    }

    /// Restore one app by name. Validates the configuration document but
    /// deliberately not the host allowlist: direct-by-name restore is the
    /// disaster-recovery path onto a replacement host.
    pub async fn restore_app(&self, name: &str, opts: &RestoreOptions) -> Result<()> {
        let result = self.restore_inner(name, opts).await;
        match &result {
            Ok(true) => {
                self.notifier
                    .send(name, Severity::Success, &format!("Restore completed (snapshot {})", opts.reference))
                    .await
            }
            Ok(false) => {} // skipped by policy, notice already sent
            Err(err) => {
                self.notifier
                    .send(name, Severity::Error, &format!("Restore failed: {:#}", err))
                    .await
            }
        }
        result.map(|_| ())
    }

    /// Fleet-wide restore in priority order. One failure does not stop the
    /// rest; outcomes aggregate into the summary.
    pub async fn restore_all(&self, opts: &RestoreOptions) -> Result<RunSummary> {
        let ordered = restore_order(discover_apps(self.cfg, DiscoveryMode::Restore)?);
        if ordered.is_empty() {
            println!("no restore-eligible apps under {}", self.cfg.apps_root.display());
            return Ok(RunSummary::default());
        }
        let mut summary = RunSummary::default();
        for app in &ordered {
            println!("\nRestoring {} (priority {})...", app.name, app.config.restore_priority);
            match self.restore_app(&app.name, opts).await {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    println!("✗ {}: {:#}", app.name, err);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Ok(true) means restored, Ok(false) means skipped by policy.
    async fn restore_inner(&self, name: &str, opts: &RestoreOptions) -> Result<bool> {
        let repo = ResticRepo::new(self.runner, self.cfg).ok_or_else(|| {
            anyhow!("remote credentials are not configured; nothing to restore from")
        })?;
        let app = AppConfig::load(&self.cfg.apps_root, name)?;
        if !app.restore_enabled {
            println!("{} has restore disabled, skipping", name);
            self.notifier
                .send(name, Severity::Info, "Restore skipped: disabled by configuration")
                .await;
            return Ok(false);
        }

        let reference = if opts.reference == "latest" {
            let snap = repo
                .latest(name)
                .await?
                .ok_or_else(|| anyhow!("no snapshot tagged '{}' in {}", name, repo.repository()))?;
            println!("  latest snapshot for {} is {} ({})", name, snap.display_id(), snap.time);
            snap.id
        } else {
            opts.reference.clone()
        };

        let location = resolve_location(&self.cfg.apps_root, &app);
        let stamp = run_timestamp();

        let was_running = if opts.data_only {
            false
        } else {
            let compose = ComposeRuntime::new(self.runner, self.cfg);
            compose.stop(&app, &location).await?
        };

        if let Some(hook) = &app.pre_restore {
            let cwd = location.parent().unwrap_or_else(|| self.cfg.apps_root.as_path());
            run_hook(self.runner, "pre_restore", hook, cwd, self.cfg.timeouts.hook).await;
        }

        let fetch_dir = std::env::temp_dir()
            .join(format!("stackbak-restore-{}", std::process::id()))
            .join(name);
        if fetch_dir.exists() {
            std::fs::remove_dir_all(&fetch_dir)
                .with_context(|| format!("failed to clear {}", fetch_dir.display()))?;
        }
        std::fs::create_dir_all(&fetch_dir)
            .with_context(|| format!("failed to create {}", fetch_dir.display()))?;

        let swapped = self
            .swap_in_snapshot(&repo, &app, &location, &fetch_dir, &reference, &stamp, opts, was_running)
            .await;

        // The staging directory is discarded no matter how the swap went.
        if let Err(err) = std::fs::remove_dir_all(&fetch_dir) {
            println!("⚠ could not remove staging directory {}: {}", fetch_dir.display(), err);
        }
        swapped?;
        println!("  ✓ {} restored from snapshot {}", name, reference);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn swap_in_snapshot(
        &self,
        repo: &ResticRepo<'_>,
        app: &AppConfig,
        location: &Path,
        fetch_dir: &Path,
        reference: &str,
        stamp: &str,
        opts: &RestoreOptions,
        was_running: bool,
    ) -> Result<()> {
        let include = self.cfg.backup_root.join(&app.name);
        repo.fetch(reference, &include, fetch_dir).await?;

        let archive = find_fetched_file(fetch_dir, |n| is_data_archive(n, &app.name))
            .ok_or_else(|| {
                anyhow!("snapshot {} contains no data archive for {}", reference, app.name)
            })?;

        let parent = location
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", location.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let guard = RollbackGuard::stage(location, stamp)?;
        if let Some(aside) = guard.aside() {
            println!("  moved current state aside to {}", aside.display());
        }

        let archive_arg = archive.display().to_string();
        let parent_arg = parent.display().to_string();
        let spec = CommandSpec::new("tar", self.cfg.timeouts.archive).args([
            "-xzf",
            archive_arg.as_str(),
            "-C",
            parent_arg.as_str(),
        ]);
        let extracted = match run_checked(self.runner, spec).await {
            Ok(_) if location.exists() => Ok(()),
            Ok(_) => Err(anyhow!("archive did not produce {}", location.display())),
            Err(err) => Err(anyhow::Error::new(err).context("extraction failed")),
        };
        if let Err(err) = extracted {
            if let Err(roll) = guard.rollback() {
                return Err(roll.context(format!(
                    "extraction failed ({:#}) and rollback did not complete",
                    err
                )));
            }
            println!("  extraction failed, previous state restored");
            return Err(err);
        }

        // The config document is provisioning state, not app data; it never
        // travels in the archive, so it is carried across the swap by hand.
        if let Some(aside) = guard.aside() {
            for doc in CONFIG_FILE_NAMES {
                let prev = aside.join(doc);
                if prev.is_file() && !location.join(doc).exists() {
                    if let Err(err) = std::fs::copy(&prev, location.join(doc)) {
                        println!("⚠ could not carry {} across the restore: {}", doc, err);
                    }
                }
            }
        }

        // Database dumps ride along for the operator; they are never loaded
        // into a running database automatically.
        for dump in find_fetched_files(fetch_dir, |n| is_db_dump(n, &app.name)) {
            let file_name = match dump.file_name() {
                Some(n) => n.to_os_string(),
                None => continue,
            };
            let dest = location.join(&file_name);
            match std::fs::copy(&dump, &dest) {
                Ok(_) => println!("  staged database dump {} (manual restore required)", dest.display()),
                Err(err) => println!("⚠ could not stage {}: {}", dump.display(), err),
            }
        }

        if let Some(hook) = &app.post_restore {
            run_hook(self.runner, "post_restore", hook, parent, self.cfg.timeouts.hook).await;
        }

        if !opts.data_only {
            let compose = ComposeRuntime::new(self.runner, self.cfg);
            if let Err(err) = compose.start(app, location).await {
                if was_running {
                    // The aside copy deliberately survives here.
                    return Err(err.context(format!(
                        "{} failed to start after restore; pre-restore copy retained",
                        app.name
                    )));
                }
                println!("⚠ {}: start failed after restore: {:#}", app.name, err);
            }
        }

        // Commit point: every post-extraction step is done.
        if let Err(err) = guard.commit() {
            println!("⚠ {:#}", err);
        }
        Ok(())
    }
}

fn find_fetched_files(root: &Path, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| matches(n))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

/// Lexicographically last match; artifact names embed the timestamp, so this
/// is the newest one when a snapshot somehow carries several.
fn find_fetched_file(root: &Path, matches: impl Fn(&str) -> bool) -> Option<PathBuf> {
    find_fetched_files(root, matches).pop()
}
