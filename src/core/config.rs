/// Typed configuration for the process and for individual apps.
///
/// [`GlobalConfig`] is read from the environment exactly once at startup and
/// passed by reference from there on; nothing downstream consults the
/// environment again. [`AppConfig`] is the per-app document (`stackbak.yml`
/// in the app's directory under the apps root), resolved in a single pass
/// with documented defaults so the rest of the code never reasons about
/// missing keys.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::utils::{
    env_duration, env_string, env_u32, CONFIG_FILE_NAMES, DEFAULT_APPS_ROOT, DEFAULT_BACKUP_ROOT,
    DEFAULT_RESTORE_PRIORITY,
};

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub apps_root: PathBuf,
    pub backup_root: PathBuf,
    /// Host identity used for repository addressing, snapshot tagging,
    /// `allowed_hosts` matching and notification payloads.
    pub host_id: String,
    /// Present only when every remote credential is configured.
    pub remote: Option<RemoteConfig>,
    pub webhook_url: Option<String>,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub bucket: String,
    pub account_id: String,
    pub account_key: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    pub stop: Duration,
    pub start: Duration,
    pub start_poll_interval: Duration,
    pub start_poll_retries: u32,
    pub remote_probe: Duration,
    pub sync: Duration,
    pub fetch: Duration,
    pub dump: Duration,
    pub hook: Duration,
    pub archive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            stop: Duration::from_secs(30),
            start: Duration::from_secs(300),
            start_poll_interval: Duration::from_secs(5),
            start_poll_retries: 12,
            remote_probe: Duration::from_secs(30),
            sync: Duration::from_secs(3600),
            fetch: Duration::from_secs(3600),
            dump: Duration::from_secs(600),
            hook: Duration::from_secs(300),
            archive: Duration::from_secs(1800),
        }
    }
}

impl Timeouts {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            stop: env_duration("STACKBAK_STOP_TIMEOUT", d.stop),
            start: env_duration("STACKBAK_START_TIMEOUT", d.start),
            start_poll_interval: env_duration("STACKBAK_START_POLL_INTERVAL", d.start_poll_interval),
            start_poll_retries: env_u32("STACKBAK_START_POLL_RETRIES", d.start_poll_retries),
            remote_probe: env_duration("STACKBAK_REMOTE_PROBE_TIMEOUT", d.remote_probe),
            sync: env_duration("STACKBAK_SYNC_TIMEOUT", d.sync),
            fetch: env_duration("STACKBAK_FETCH_TIMEOUT", d.fetch),
            dump: env_duration("STACKBAK_DUMP_TIMEOUT", d.dump),
            hook: env_duration("STACKBAK_HOOK_TIMEOUT", d.hook),
            archive: env_duration("STACKBAK_ARCHIVE_TIMEOUT", d.archive),
        }
    }
}

impl GlobalConfig {
    /// Read the process configuration from the environment. Called once in
    /// main, after the dotenv pass.
    pub fn from_env() -> Self {
        Self {
            apps_root: env_string("STACKBAK_APPS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_APPS_ROOT)),
            backup_root: env_string("STACKBAK_BACKUP_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_ROOT)),
            host_id: env_string("STACKBAK_HOST_ID").unwrap_or_else(default_host_id),
            remote: RemoteConfig::from_env(),
            webhook_url: env_string("STACKBAK_WEBHOOK_URL"),
            timeouts: Timeouts::from_env(),
        }
    }
}

impl RemoteConfig {
    /// All four credentials must be present; anything less means local-only
    /// operation.
    fn from_env() -> Option<Self> {
        Some(Self {
            bucket: env_string("STACKBAK_B2_BUCKET")?,
            account_id: env_string("B2_ACCOUNT_ID")?,
            account_key: env_string("B2_ACCOUNT_KEY")?,
            password: env_string("RESTIC_PASSWORD")?,
        })
    }
}

fn default_host_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Per-application settings, fully resolved. Loaded fresh for every
/// operation; never cached across operations.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub backup_enabled: bool,
    pub backup_paths: Vec<String>,
    pub exclude: Vec<String>,
    pub stop_during_backup: bool,
    pub hot_backup: bool,
    pub pre_backup: Option<String>,
    pub post_backup: Option<String>,
    pub restore_enabled: bool,
    pub restore_priority: i64,
    pub pre_restore: Option<String>,
    pub post_restore: Option<String>,
    pub install_path: Option<PathBuf>,
    pub allowed_hosts: Vec<String>,
    pub infisical_path: Option<String>,
}

impl AppConfig {
    /// Locate the app's configuration document. The document always lives in
    /// `apps_root/<name>/`, independent of any install-path override.
    pub fn document_path(apps_root: &Path, name: &str) -> Option<PathBuf> {
        CONFIG_FILE_NAMES
            .iter()
            .map(|f| apps_root.join(name).join(f))
            .find(|p| p.is_file())
    }

    /// Load and resolve the app's configuration in one pass. An empty
    /// document is valid and yields all defaults.
    pub fn load(apps_root: &Path, name: &str) -> Result<Self> {
        let path = Self::document_path(apps_root, name).with_context(|| {
            format!(
                "no configuration document for '{}' under {}",
                name,
                apps_root.display()
            )
        })?;
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let doc: ConfigDoc = if raw.trim().is_empty() {
            ConfigDoc::default()
        } else {
            serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        };
        Ok(Self::resolve(name, doc))
    }

    fn resolve(name: &str, doc: ConfigDoc) -> Self {
        Self {
            name: name.to_string(),
            backup_enabled: doc.backup.enabled,
            backup_paths: doc.backup.paths,
            exclude: doc.backup.exclude,
            stop_during_backup: doc.backup.stop_during_backup,
            hot_backup: doc.hot_backup,
            pre_backup: doc.backup.pre_backup,
            post_backup: doc.backup.post_backup,
            restore_enabled: doc.restore.enabled,
            restore_priority: doc.restore.priority,
            pre_restore: doc.restore.pre_restore,
            post_restore: doc.restore.post_restore,
            install_path: doc.paths.install_path,
            allowed_hosts: doc.allowed_hosts,
            infisical_path: doc.secrets.infisical_path,
        }
    }

    /// Whether containers should be stopped around this app's capture or
    /// extraction. `hot_backup: true` wins over `stop_during_backup`,
    /// unconditionally.
    pub fn should_stop(&self) -> bool {
        !self.hot_backup && self.stop_during_backup
    }

    /// An empty allowlist means the app may run on any host.
    pub fn host_allowed(&self, host_id: &str) -> bool {
        self.allowed_hosts.is_empty() || self.allowed_hosts.iter().any(|h| h == host_id)
    }
}

#[cfg(test)]
impl AppConfig {
    /// All-defaults config for unit tests.
    pub fn for_tests(name: &str) -> Self {
        Self::resolve(name, ConfigDoc::default())
    }
}

// Raw document shape. Kept separate from AppConfig so serde defaults and the
// resolved view cannot drift apart silently.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigDoc {
    backup: BackupSection,
    restore: RestoreSection,
    paths: PathsSection,
    secrets: SecretsSection,
    hot_backup: bool,
    allowed_hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct BackupSection {
    enabled: bool,
    paths: Vec<String>,
    exclude: Vec<String>,
    stop_during_backup: bool,
    pre_backup: Option<String>,
    post_backup: Option<String>,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: Vec::new(),
            exclude: Vec::new(),
            stop_during_backup: true,
            pre_backup: None,
            post_backup: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RestoreSection {
    enabled: bool,
    priority: i64,
    pre_restore: Option<String>,
    post_restore: Option<String>,
}

impl Default for RestoreSection {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: DEFAULT_RESTORE_PRIORITY,
            pre_restore: None,
            post_restore: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PathsSection {
    install_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SecretsSection {
    infisical_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_doc(dir: &TempDir, app: &str, content: &str) {
        let app_dir = dir.path().join(app);
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("stackbak.yml"), content).unwrap();
    }

    #[test]
    fn test_full_document() {
        let dir = TempDir::new().unwrap();
        write_doc(
            &dir,
            "vaultwarden",
            r#"
backup:
  enabled: true
  paths:
    - ./data
    - /config
  exclude:
    - "*.sqlite3-wal"
  stop_during_backup: true
  pre_backup: "echo pre"
  post_backup: "echo post"
restore:
  enabled: true
  priority: 10
  pre_restore: "echo before"
  post_restore: "echo after"
paths:
  install_path: /srv/vaultwarden
secrets:
  infisical_path: /homelab/vaultwarden
allowed_hosts:
  - nas-01
"#,
        );

        let config = AppConfig::load(dir.path(), "vaultwarden").unwrap();
        assert_eq!(config.name, "vaultwarden");
        assert!(config.backup_enabled);
        assert_eq!(config.backup_paths, vec!["./data", "/config"]);
        assert_eq!(config.exclude, vec!["*.sqlite3-wal"]);
        assert_eq!(config.restore_priority, 10);
        assert_eq!(config.pre_backup.as_deref(), Some("echo pre"));
        assert_eq!(config.post_restore.as_deref(), Some("echo after"));
        assert_eq!(config.install_path, Some(PathBuf::from("/srv/vaultwarden")));
        assert_eq!(config.infisical_path.as_deref(), Some("/homelab/vaultwarden"));
        assert_eq!(config.allowed_hosts, vec!["nas-01"]);
        assert!(config.should_stop());
    }

    #[test]
    fn test_empty_document_gets_defaults() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "mealie", "");

        let config = AppConfig::load(dir.path(), "mealie").unwrap();
        assert!(config.backup_enabled);
        assert!(config.backup_paths.is_empty());
        assert!(config.stop_during_backup);
        assert!(!config.hot_backup);
        assert!(config.restore_enabled);
        assert_eq!(config.restore_priority, DEFAULT_RESTORE_PRIORITY);
        assert!(config.allowed_hosts.is_empty());
        assert!(config.host_allowed("any-host"));
        assert!(config.should_stop());
    }

    #[test]
    fn test_hot_backup_overrides_stop() {
        let dir = TempDir::new().unwrap();
        write_doc(
            &dir,
            "grafana",
            "hot_backup: true\nbackup:\n  stop_during_backup: true\n",
        );

        let config = AppConfig::load(dir.path(), "grafana").unwrap();
        assert!(config.hot_backup);
        assert!(config.stop_during_backup);
        assert!(!config.should_stop());
    }

    #[test]
    fn test_host_allowlist() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "pihole", "allowed_hosts:\n  - nas-01\n  - nas-02\n");

        let config = AppConfig::load(dir.path(), "pihole").unwrap();
        assert!(config.host_allowed("nas-01"));
        assert!(config.host_allowed("nas-02"));
        assert!(!config.host_allowed("laptop"));
    }

    #[test]
    fn test_missing_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("ghost")).unwrap();

        let err = AppConfig::load(dir.path(), "ghost").unwrap_err();
        assert!(err.to_string().contains("no configuration document"));
    }

    #[test]
    fn test_malformed_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_doc(&dir, "broken", "backup: [not, a, mapping\n");

        assert!(AppConfig::load(dir.path(), "broken").is_err());
    }

    #[test]
    fn test_yaml_extension_accepted() {
        let dir = TempDir::new().unwrap();
        let app_dir = dir.path().join("uptime");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("stackbak.yaml"), "restore:\n  priority: 5\n").unwrap();

        let config = AppConfig::load(dir.path(), "uptime").unwrap();
        assert_eq!(config.restore_priority, 5);
    }

    #[test]
    fn test_timeout_defaults() {
        let t = Timeouts::default();
        assert_eq!(t.stop, Duration::from_secs(30));
        assert_eq!(t.start_poll_retries, 12);
        assert_eq!(t.sync, Duration::from_secs(3600));
        assert_eq!(t.dump, Duration::from_secs(600));
    }
}
