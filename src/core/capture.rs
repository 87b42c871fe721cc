/// Filesystem and database capture.
///
/// Data paths are archived with tar into one timestamped `tar.gz` per run;
/// database engines detected among the app's running containers are dumped
/// through `docker exec`, gzip-compressed on the way to disk. Archives are
/// fatal when they fail, dumps are best-effort.
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::core::config::{AppConfig, GlobalConfig};
use crate::core::discovery::find_compose_file;
use crate::core::docker::{compose_ps, ComposeContainer};
use crate::core::runner::{run_checked, CommandRunner, CommandSpec};
use crate::utils::{
    archive_name, dump_name, format_bytes, BUILT_IN_EXCLUDES, DEFAULT_BACKUP_SUBDIR,
};

/// Database engines probed for, in fixed order. The first running container
/// matching a family wins for that family; distinct families may each
/// produce a dump in the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbEngine {
    Postgres,
    MongoDb,
    MariaDb,
    MySql,
}

impl DbEngine {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MongoDb => "mongodb",
            Self::MariaDb => "mariadb",
            Self::MySql => "mysql",
        }
    }

    pub fn file_ext(&self) -> &'static str {
        match self {
            Self::MongoDb => "archive.gz",
            _ => "sql.gz",
        }
    }

    /// Full-instance dump command executed inside the container. Credentials
    /// come from the container's own environment.
    pub fn dump_command(&self) -> &'static str {
        match self {
            Self::Postgres => r#"pg_dumpall -U "${POSTGRES_USER:-postgres}""#,
            Self::MongoDb => "mongodump --archive",
            Self::MariaDb => {
                r#"mariadb-dump --all-databases -uroot -p"${MARIADB_ROOT_PASSWORD:-$MYSQL_ROOT_PASSWORD}""#
            }
            Self::MySql => r#"mysqldump --all-databases -uroot -p"${MYSQL_ROOT_PASSWORD}""#,
        }
    }
}

fn engine_for_image(image: &str) -> Option<DbEngine> {
    let image = image.to_lowercase();
    if image.contains("postgres") {
        Some(DbEngine::Postgres)
    } else if image.contains("mongo") {
        Some(DbEngine::MongoDb)
    } else if image.contains("mariadb") {
        Some(DbEngine::MariaDb)
    } else if image.contains("mysql") {
        Some(DbEngine::MySql)
    } else {
        None
    }
}

/// Pick at most one running container per engine family, in probe order:
/// Postgres, then MongoDB, then MariaDB/MySQL (one slot for the pair).
pub fn detect_databases(containers: &[ComposeContainer]) -> Vec<(DbEngine, String)> {
    let running: Vec<&ComposeContainer> = containers.iter().filter(|c| c.is_running()).collect();
    let mut found = Vec::new();

    for c in &running {
        if engine_for_image(&c.image) == Some(DbEngine::Postgres) {
            found.push((DbEngine::Postgres, c.name.clone()));
            break;
        }
    }
    for c in &running {
        if engine_for_image(&c.image) == Some(DbEngine::MongoDb) {
            found.push((DbEngine::MongoDb, c.name.clone()));
            break;
        }
    }
    for c in &running {
        if let Some(engine) = engine_for_image(&c.image) {
            if matches!(engine, DbEngine::MariaDb | DbEngine::MySql) {
                found.push((engine, c.name.clone()));
                break;
            }
        }
    }
    found
}

pub struct CaptureEngine<'a> {
    runner: &'a dyn CommandRunner,
    cfg: &'a GlobalConfig,
}

impl<'a> CaptureEngine<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cfg: &'a GlobalConfig) -> Self {
        Self { runner, cfg }
    }

    fn app_backup_dir(&self, app: &AppConfig) -> PathBuf {
        self.cfg.backup_root.join(&app.name)
    }

    /// Archive the app's configured paths into one timestamped tar.gz. The
    /// archive is rooted at the parent of the app location so entries keep
    /// the app directory name, and the compose descriptor rides along so a
    /// snapshot is self-describing.
    pub async fn capture_data(&self, app: &AppConfig, location: &Path, stamp: &str) -> Result<PathBuf> {
        let parent = location
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", location.display()))?;
        let dir_name = location
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no usable directory name", location.display()))?;

        let mut members = resolve_members(app, parent, dir_name);
        if members.is_empty() {
            bail!("{}: none of the configured backup paths exist", app.name);
        }
        if let Some(compose) = find_compose_file(location) {
            if let Some(name) = compose.file_name().and_then(|n| n.to_str()) {
                members.push(format!("{}/{}", dir_name, name));
            }
        }

        let backup_dir = self.app_backup_dir(app);
        std::fs::create_dir_all(&backup_dir)
            .with_context(|| format!("failed to create {}", backup_dir.display()))?;
        let archive = backup_dir.join(archive_name(&app.name, stamp));
        let archive_arg = archive.display().to_string();
        let parent_arg = parent.display().to_string();

        let mut spec = CommandSpec::new("tar", self.cfg.timeouts.archive);
        for glob in BUILT_IN_EXCLUDES {
            spec = spec.arg(format!("--exclude={}", glob));
        }
        for glob in &app.exclude {
            spec = spec.arg(format!("--exclude={}", glob));
        }
        spec = spec.args(["-czf", archive_arg.as_str(), "-C", parent_arg.as_str()]);
        for member in &members {
            spec = spec.arg(member.as_str());
        }

        let result = run_checked(self.runner, spec).await;
        let size = std::fs::metadata(&archive).map(|m| m.len()).unwrap_or(0);
        if result.is_err() || size == 0 {
            // Never leave a broken artifact behind to be synced later.
            let _ = std::fs::remove_file(&archive);
            match result {
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("archive creation failed for {}", app.name))
                }
                Ok(_) => bail!("{}: archive {} is missing or empty", app.name, archive.display()),
            }
        }

        println!("  ✓ archive {} ({})", archive.display(), format_bytes(size));
        Ok(archive)
    }

    /// Dump every database engine detected among the app's running
    /// containers. Best-effort: a failed dump is reported and skipped, never
    /// fatal; the data paths already carry the durable state.
    pub async fn capture_databases(&self, app: &AppConfig, location: &Path, stamp: &str) -> Vec<PathBuf> {
        let containers = match compose_ps(self.runner, location).await {
            Ok(containers) => containers,
            Err(err) => {
                println!(
                    "⚠ {}: could not probe containers for databases: {:#}",
                    app.name, err
                );
                return Vec::new();
            }
        };

        let backup_dir = self.app_backup_dir(app);
        let _ = std::fs::create_dir_all(&backup_dir);

        let mut dumps = Vec::new();
        for (engine, container) in detect_databases(&containers) {
            let dest = backup_dir.join(dump_name(&app.name, engine.label(), stamp, engine.file_ext()));
            let spec = CommandSpec::new("docker", self.cfg.timeouts.dump).args([
                "exec",
                container.as_str(),
                "sh",
                "-c",
                engine.dump_command(),
            ]);
            match self.runner.run_gzip_to_file(spec, &dest).await {
                Ok(bytes) => {
                    println!(
                        "  ✓ {} dump from {} ({})",
                        engine.label(),
                        container,
                        format_bytes(bytes)
                    );
                    dumps.push(dest);
                }
                Err(err) => {
                    println!("⚠ {}: {} dump failed: {}", app.name, engine.label(), err);
                    let _ = std::fs::remove_file(&dest);
                }
            }
        }
        dumps
    }

    /// Local retention: after a successful capture, the app's staging
    /// directory keeps only the current run's artifacts. Remote history is
    /// the system of record for older generations.
    pub fn prune_stale_artifacts(&self, app: &AppConfig, stamp: &str) -> Result<usize> {
        let dir = self.app_backup_dir(app);
        let mut removed = 0;
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.path().is_file() && !name.contains(stamp) {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("failed to remove stale artifact {}", name))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Resolve configured backup paths (`./x`, `/x` and bare `x` forms, all
/// relative to the app location) into archive members prefixed with the app
/// directory name. Members missing on disk are dropped with a warning.
fn resolve_members(app: &AppConfig, parent: &Path, dir_name: &str) -> Vec<String> {
    let mut configured: Vec<String> = app
        .backup_paths
        .iter()
        .map(|p| p.trim())
        .map(|p| p.strip_prefix("./").unwrap_or(p))
        .map(|p| p.trim_start_matches('/'))
        .map(|p| p.trim_end_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect();
    if configured.is_empty() {
        configured.push(DEFAULT_BACKUP_SUBDIR.to_string());
    }

    let mut members = Vec::new();
    for rel in configured {
        let member = format!("{}/{}", dir_name, rel);
        if parent.join(&member).exists() {
            members.push(member);
        } else {
            println!("⚠ {}: configured path {} does not exist, skipping", app.name, member);
        }
    }
    members
}
