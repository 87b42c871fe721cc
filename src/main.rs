mod cli;
mod core;
mod utils;

use anyhow::{bail, Result};
use clap::Parser;
use colored::Colorize;

use crate::cli::{Cli, Commands};
use crate::core::backup::{BackupJob, RunSummary};
use crate::core::config::GlobalConfig;
use crate::core::discovery::{discover_apps, DiscoveryMode};
use crate::core::notify::Notifier;
use crate::core::remote::ResticRepo;
use crate::core::restore::{restore_order, RestoreOptions, RestoreOrchestrator};
use crate::core::runner::{tool_available, CommandRunner, SystemRunner};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let cfg = GlobalConfig::from_env();
    let runner = SystemRunner;

    match cli.command {
        Commands::Backup { target } => {
            handle_backup(&cfg, &runner, &target).await?;
        }
        Commands::Restore {
            target,
            snapshot_ref,
            data_only,
        } => {
            handle_restore(&cfg, &runner, &target, snapshot_ref, data_only).await?;
        }
        Commands::Check => {
            handle_check(&cfg, &runner).await?;
        }
    }

    Ok(())
}

async fn handle_backup(cfg: &GlobalConfig, runner: &dyn CommandRunner, target: &str) -> Result<()> {
    if target == "list" {
        return print_backup_list(cfg);
    }

    let mut required = vec!["docker", "tar"];
    if cfg.remote.is_some() {
        required.push("restic");
    }
    require_tools(runner, &required).await?;

    let notifier = Notifier::new(cfg)?;
    let job = BackupJob::new(cfg, runner, &notifier);

    if target == "all" {
        let summary = job.backup_all().await?;
        print_summary(summary);
        if summary.failed > 0 {
            bail!("{} app(s) failed to back up", summary.failed);
        }
        return Ok(());
    }

    job.backup_app(target).await?;
    println!("{} backup of {} finished", "✓".green(), target);
    Ok(())
}

async fn handle_restore(
    cfg: &GlobalConfig,
    runner: &dyn CommandRunner,
    target: &str,
    snapshot_ref: String,
    data_only: bool,
) -> Result<()> {
    if target == "list" {
        return print_restore_list(cfg, runner).await;
    }

    let mut required = vec!["restic", "tar"];
    if !data_only {
        required.push("docker");
    }
    require_tools(runner, &required).await?;

    let notifier = Notifier::new(cfg)?;
    let orchestrator = RestoreOrchestrator::new(cfg, runner, &notifier);
    let opts = RestoreOptions {
        reference: snapshot_ref,
        data_only,
    };

    if target == "all" {
        let summary = orchestrator.restore_all(&opts).await?;
        print_summary(summary);
        if summary.failed > 0 {
            bail!("{} app(s) failed to restore", summary.failed);
        }
        return Ok(());
    }

    orchestrator.restore_app(target, &opts).await?;
    println!("{} restore of {} finished", "✓".green(), target);
    Ok(())
}

async fn handle_check(cfg: &GlobalConfig, runner: &dyn CommandRunner) -> Result<()> {
    println!("stackbak {}\n", cli::VERSION_WITH_BUILD);
    let mut problems: Vec<String> = Vec::new();

    println!("Environment");
    println!("{}", "-".repeat(60));
    println!("{:<22} {}", "apps root", cfg.apps_root.display());
    println!("{:<22} {}", "backup root", cfg.backup_root.display());
    println!("{:<22} {}", "host id", cfg.host_id);
    match &cfg.remote {
        Some(remote) => println!("{:<22} b2:{}:{}", "remote repository", remote.bucket, cfg.host_id),
        None => println!("{:<22} not configured (local-only)", "remote repository"),
    }
    println!(
        "{:<22} {}",
        "webhook",
        cfg.webhook_url.as_deref().unwrap_or("not configured")
    );

    if !cfg.apps_root.is_dir() {
        problems.push(format!("apps root {} does not exist", cfg.apps_root.display()));
    }

    println!("\nTools");
    println!("{}", "-".repeat(60));
    let tools = [
        ("docker", true),
        ("tar", true),
        ("restic", cfg.remote.is_some()),
        ("infisical", false),
    ];
    for (program, required) in tools {
        let present = tool_available(runner, program).await;
        let glyph = if present {
            "✓".green()
        } else if required {
            "✗".red()
        } else {
            "⚠".yellow()
        };
        let note = match (present, required) {
            (true, _) => "",
            (false, true) => " (required)",
            (false, false) => " (optional)",
        };
        println!("{} {:<20}{}", glyph, program, note);
        if !present && required {
            problems.push(format!("{} is not installed", program));
        }
    }

    if cfg.apps_root.is_dir() {
        println!("\nApps");
        println!("{}", "-".repeat(60));
        let backup = discover_apps(cfg, DiscoveryMode::Backup)?;
        let restore = discover_apps(cfg, DiscoveryMode::Restore)?;
        println!("{:<22} {}", "backup-eligible", backup.len());
        println!("{:<22} {}", "restore-eligible", restore.len());
    }

    if problems.is_empty() {
        println!("\n{} everything checks out", "✓".green());
        Ok(())
    } else {
        println!();
        for problem in &problems {
            println!("{} {}", "✗".red(), problem);
        }
        bail!("{} problem(s) found", problems.len());
    }
}

fn print_backup_list(cfg: &GlobalConfig) -> Result<()> {
    let apps = discover_apps(cfg, DiscoveryMode::Backup)?;

    println!("Backup-eligible apps under {}\n", cfg.apps_root.display());
    println!("{:<24} {:<6} {:<6} {}", "App", "Stop", "Hot", "Location");
    println!("{}", "-".repeat(72));
    for app in &apps {
        println!(
            "{:<24} {:<6} {:<6} {}",
            app.name,
            if app.config.should_stop() { "yes" } else { "no" },
            if app.config.hot_backup { "yes" } else { "no" },
            app.location.display()
        );
    }
    println!("\n{} app(s)", apps.len());
    Ok(())
}

async fn print_restore_list(cfg: &GlobalConfig, runner: &dyn CommandRunner) -> Result<()> {
    let ordered = restore_order(discover_apps(cfg, DiscoveryMode::Restore)?);
    let repo = ResticRepo::new(runner, cfg);

    println!("Restore order under {}\n", cfg.apps_root.display());
    println!("{:<6} {:<24} {:<14} {}", "Prio", "App", "Snapshot", "Taken");
    println!("{}", "-".repeat(72));
    for app in &ordered {
        let latest = match &repo {
            Some(repo) => repo.latest(&app.name).await.unwrap_or(None),
            None => None,
        };
        let (id, taken) = match &latest {
            Some(snap) => (snap.display_id().to_string(), snap.time.to_rfc3339()),
            None => ("-".to_string(), "-".to_string()),
        };
        println!(
            "{:<6} {:<24} {:<14} {}",
            app.config.restore_priority, app.name, id, taken
        );
    }
    if repo.is_none() {
        println!("\n⚠ remote credentials not configured, snapshot column unavailable");
    }
    println!("\n{} app(s)", ordered.len());
    Ok(())
}

fn print_summary(summary: RunSummary) {
    println!();
    if summary.failed == 0 {
        println!("{} fleet run complete: {} succeeded", "✓".green(), summary.succeeded);
    } else {
        println!(
            "{} fleet run finished: {} succeeded, {} failed",
            "✗".red(),
            summary.succeeded,
            summary.failed
        );
    }
}

async fn require_tools(runner: &dyn CommandRunner, programs: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    for program in programs {
        if !tool_available(runner, program).await {
            missing.push(*program);
        }
    }
    if !missing.is_empty() {
        bail!("required tool(s) not installed: {}", missing.join(", "));
    }
    Ok(())
}
