/// Container lifecycle control over the compose CLI.
///
/// Stops are graceful-with-escalation: `compose stop -t <grace>` first,
/// `compose kill` when that fails. Starts go through `compose up -d`
/// (wrapped in the secrets injector when configured) followed by a bounded
/// status poll. Apps marked `hot_backup` are never touched.
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::config::{AppConfig, GlobalConfig, Timeouts};
use crate::core::discovery::find_compose_file;
use crate::core::runner::{run_checked, tool_available, CommandRunner, CommandSpec};
use crate::utils::COMPOSE_PS_TIMEOUT;

/// One entry of `docker compose ps --format json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ComposeContainer {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "Service", default)]
    pub service: String,
}

impl ComposeContainer {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// Parse `compose ps` JSON. Newer compose releases emit one object per line,
/// older ones a single array; both shapes are accepted.
pub fn parse_compose_ps(stdout: &str) -> Vec<ComposeContainer> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_default()
    } else {
        trimmed
            .lines()
            .filter_map(|line| serde_json::from_str(line.trim()).ok())
            .collect()
    }
}

/// List the containers of the compose project at `location`.
pub async fn compose_ps(
    runner: &dyn CommandRunner,
    location: &Path,
) -> Result<Vec<ComposeContainer>> {
    let spec = CommandSpec::new("docker", COMPOSE_PS_TIMEOUT)
        .args(["compose", "ps", "--format", "json"])
        .cwd(location);
    let output = run_checked(runner, spec)
        .await
        .context("failed to query container status")?;
    Ok(parse_compose_ps(&output.stdout))
}

pub struct ComposeRuntime<'a> {
    runner: &'a dyn CommandRunner,
    timeouts: &'a Timeouts,
}

impl<'a> ComposeRuntime<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cfg: &'a GlobalConfig) -> Self {
        Self {
            runner,
            timeouts: &cfg.timeouts,
        }
    }

    /// Stop the app's containers ahead of a capture or extraction. Returns
    /// whether anything was actually running, which tells the caller whether
    /// a restart is owed afterwards. Stop failures are tolerated: the
    /// escalation path is the recovery, and captures proceed regardless.
    pub async fn stop(&self, app: &AppConfig, location: &Path) -> Result<bool> {
        if !app.should_stop() {
            if app.hot_backup {
                println!("  hot backup enabled for {}, leaving containers up", app.name);
            }
            return Ok(false);
        }
        if find_compose_file(location).is_none() {
            println!(
                "⚠ {}: no compose project at {}, nothing to stop",
                app.name,
                location.display()
            );
            return Ok(false);
        }

        let running = match compose_ps(self.runner, location).await {
            Ok(containers) => containers.into_iter().filter(|c| c.is_running()).count(),
            Err(err) => {
                println!("⚠ {}: could not query container state: {:#}", app.name, err);
                0
            }
        };
        if running == 0 {
            return Ok(false);
        }

        println!("  stopping {} container(s)...", running);
        let grace = self.timeouts.stop;
        let grace_secs = grace.as_secs().to_string();
        let spec = CommandSpec::new("docker", grace * 2)
            .args(["compose", "stop", "-t", grace_secs.as_str()])
            .cwd(location);
        if let Err(err) = run_checked(self.runner, spec).await {
            println!(
                "⚠ {}: graceful stop failed ({}), killing containers",
                app.name, err
            );
            let kill = CommandSpec::new("docker", self.timeouts.stop)
                .args(["compose", "kill"])
                .cwd(location);
            if let Err(err) = run_checked(self.runner, kill).await {
                println!("⚠ {}: kill failed too: {}", app.name, err);
            }
        }
        Ok(true)
    }

    /// Bring the app up and poll until a container reports running. A poll
    /// that never confirms is a warning, not a failure: the app may simply
    /// be slow to initialize. A failed `up` is returned to the caller, which
    /// knows whether containers were running beforehand.
    pub async fn start(&self, app: &AppConfig, location: &Path) -> Result<()> {
        if !app.should_stop() {
            return Ok(());
        }
        if find_compose_file(location).is_none() {
            println!(
                "⚠ {}: no compose project at {}, nothing to start",
                app.name,
                location.display()
            );
            return Ok(());
        }

        let spec = self.up_spec(app, location).await;
        run_checked(self.runner, spec)
            .await
            .with_context(|| format!("failed to start {}", app.name))?;

        self.wait_until_running(app, location).await;
        Ok(())
    }

    /// `docker compose up -d`, wrapped in the secrets injector when one is
    /// configured and the binary is present.
    async fn up_spec(&self, app: &AppConfig, location: &Path) -> CommandSpec {
        if let Some(path) = &app.infisical_path {
            if tool_available(self.runner, "infisical").await {
                return CommandSpec::new("infisical", self.timeouts.start)
                    .args(["run", "--path", path.as_str(), "--", "docker", "compose", "up", "-d"])
                    .cwd(location);
            }
            println!(
                "⚠ {}: infisical not found, starting without secrets injection",
                app.name
            );
        }
        CommandSpec::new("docker", self.timeouts.start)
            .args(["compose", "up", "-d"])
            .cwd(location)
    }

    async fn wait_until_running(&self, app: &AppConfig, location: &Path) {
        for attempt in 0..self.timeouts.start_poll_retries {
            if attempt > 0 {
                tokio::time::sleep(self.timeouts.start_poll_interval).await;
            }
            match compose_ps(self.runner, location).await {
                Ok(containers) if containers.iter().any(|c| c.is_running()) => {
                    println!("  {} is up", app.name);
                    return;
                }
                Ok(_) => {}
                Err(err) => println!("⚠ {}: status poll failed: {:#}", app.name, err),
            }
        }
        println!(
            "⚠ {}: containers not confirmed running after {} polls, continuing",
            app.name, self.timeouts.start_poll_retries
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::runner::scripted::ScriptedRunner;
    use crate::core::runner::MockCommandRunner;
    use tempfile::TempDir;

    const RUNNING_PS: &str = r#"[{"Name":"vw-app-1","State":"running","Image":"vaultwarden/server:latest","Service":"app"}]"#;

    fn test_cfg() -> GlobalConfig {
        let mut timeouts = Timeouts::default();
        timeouts.start_poll_interval = Duration::from_millis(1);
        timeouts.start_poll_retries = 2;
        GlobalConfig {
            apps_root: std::env::temp_dir(),
            backup_root: std::env::temp_dir(),
            host_id: "nas-01".to_string(),
            remote: None,
            webhook_url: None,
            timeouts,
        }
    }

    fn compose_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("compose.yaml"), "services: {}\n").unwrap();
        dir
    }

    #[test]
    fn test_parse_array_shape() {
        let containers = parse_compose_ps(RUNNING_PS);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "vw-app-1");
        assert!(containers[0].is_running());
    }

    #[test]
    fn test_parse_ndjson_shape() {
        let out = "{\"Name\":\"a\",\"State\":\"running\"}\n{\"Name\":\"b\",\"State\":\"exited\"}\n";
        let containers = parse_compose_ps(out);
        assert_eq!(containers.len(), 2);
        assert!(containers[0].is_running());
        assert!(!containers[1].is_running());
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert!(parse_compose_ps("").is_empty());
        assert!(parse_compose_ps("   \n").is_empty());
        assert!(parse_compose_ps("not json at all").is_empty());
    }

    #[tokio::test]
    async fn test_hot_app_is_never_touched() {
        // No expectations on the mock: any runner call would panic.
        let runner = MockCommandRunner::new();
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let mut app = AppConfig::for_tests("grafana");
        app.hot_backup = true;

        assert!(!rt.stop(&app, dir.path()).await.unwrap());
        rt.start(&app, dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_disabled_is_a_no_op() {
        let runner = MockCommandRunner::new();
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let mut app = AppConfig::for_tests("pihole");
        app.stop_during_backup = false;

        assert!(!rt.stop(&app, dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_without_running_containers_skips_stop_command() {
        let runner = ScriptedRunner::new();
        runner.ok("compose ps", "[]");
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let app = AppConfig::for_tests("vaultwarden");
        assert!(!rt.stop(&app, dir.path()).await.unwrap());
        assert_eq!(runner.count_matching("compose stop"), 0);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill_on_failure() {
        let runner = ScriptedRunner::new();
        runner.ok("compose ps", RUNNING_PS);
        runner.fail("compose stop", 1, "deadline exceeded");
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let app = AppConfig::for_tests("vaultwarden");
        let was_running = rt.stop(&app, dir.path()).await.unwrap();
        assert!(was_running);
        assert_eq!(runner.count_matching("compose stop -t 30"), 1);
        assert_eq!(runner.count_matching("compose kill"), 1);
    }

    #[tokio::test]
    async fn test_start_uses_secrets_injector_when_configured() {
        let runner = ScriptedRunner::new();
        runner.ok("compose ps", RUNNING_PS);
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let mut app = AppConfig::for_tests("vaultwarden");
        app.infisical_path = Some("/homelab/vaultwarden".to_string());

        rt.start(&app, dir.path()).await.unwrap();
        assert_eq!(
            runner.count_matching("infisical run --path /homelab/vaultwarden -- docker compose up -d"),
            1
        );
    }

    #[tokio::test]
    async fn test_start_falls_back_when_injector_missing() {
        let runner = ScriptedRunner::new();
        runner.not_found("infisical --version");
        runner.ok("compose ps", RUNNING_PS);
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let mut app = AppConfig::for_tests("vaultwarden");
        app.infisical_path = Some("/homelab/vaultwarden".to_string());

        rt.start(&app, dir.path()).await.unwrap();
        assert_eq!(runner.count_matching("docker compose up -d"), 1);
    }

    #[tokio::test]
    async fn test_start_poll_timeout_is_not_fatal() {
        let runner = ScriptedRunner::new();
        runner.ok("compose ps", "[]");
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let app = AppConfig::for_tests("slowstart");
        rt.start(&app, dir.path()).await.unwrap();
        // Two polls configured, both report nothing running.
        assert_eq!(runner.count_matching("compose ps"), 2);
    }

    #[tokio::test]
    async fn test_start_failure_is_returned() {
        let runner = ScriptedRunner::new();
        runner.fail("compose up", 1, "port already allocated");
        let cfg = test_cfg();
        let rt = ComposeRuntime::new(&runner, &cfg);
        let dir = compose_dir();

        let app = AppConfig::for_tests("vaultwarden");
        let err = rt.start(&app, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
