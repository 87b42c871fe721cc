//! Fixed operational constants shared across the backup and restore paths.

use std::time::Duration;

// ============================================================================
// Filesystem Layout
// ============================================================================

/// Default directory scanned for applications.
pub const DEFAULT_APPS_ROOT: &str = "/opt/stacks";

/// Default local staging directory for captured artifacts.
pub const DEFAULT_BACKUP_ROOT: &str = "/var/backups/stackbak";

/// Per-app configuration document names, first match wins.
pub const CONFIG_FILE_NAMES: &[&str] = &["stackbak.yml", "stackbak.yaml"];

/// Compose descriptor names accepted in an app directory, first match wins.
pub const COMPOSE_FILE_NAMES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yml",
    "docker-compose.yaml",
];

/// Subdirectory archived when an app configures no explicit backup paths.
pub const DEFAULT_BACKUP_SUBDIR: &str = "data";

/// Globs excluded from every archive, merged with per-app excludes.
pub const BUILT_IN_EXCLUDES: &[&str] = &["*.log", "*.tmp", "*.pid"];

/// Timestamp embedded in artifact names, e.g. `20250821-134501`.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

// ============================================================================
// Snapshot Repository
// ============================================================================

/// Every snapshot carries its app tag plus this fleet-wide tag.
pub const FLEET_TAG: &str = "fleet";

/// Retention buckets applied after every successful push.
pub const KEEP_DAILY: u32 = 7;
pub const KEEP_WEEKLY: u32 = 4;
pub const KEEP_MONTHLY: u32 = 3;

/// Apps without an explicit restore priority sort here (lower runs earlier).
pub const DEFAULT_RESTORE_PRIORITY: i64 = 50;

// ============================================================================
// Timing
// ============================================================================

/// Hard cap on webhook delivery; notifications never stall a job.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on `docker compose ps` status queries.
pub const COMPOSE_PS_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on `--version` probes used to detect installed tools.
pub const TOOL_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
