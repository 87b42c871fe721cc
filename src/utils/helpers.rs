/// Small shared helpers: environment parsing, artifact naming, formatting.
use std::time::Duration;

use chrono::Local;

use super::constants::TIMESTAMP_FORMAT;

/// Read a trimmed, non-empty environment variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a duration like `30s`, `10m` or `1h`; invalid values fall back to the
/// default with a warning rather than aborting the run.
pub fn env_duration(key: &str, default: Duration) -> Duration {
    match env_string(key) {
        Some(raw) => match humantime::parse_duration(&raw) {
            Ok(parsed) => parsed,
            Err(_) => {
                println!(
                    "⚠ {} is not a valid duration ('{}'), using {}",
                    key,
                    raw,
                    humantime::format_duration(default)
                );
                default
            }
        },
        None => default,
    }
}

pub fn env_u32(key: &str, default: u32) -> u32 {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                println!("⚠ {} is not a valid number ('{}'), using {}", key, raw, default);
                default
            }
        },
        None => default,
    }
}

/// Timestamp stamped onto every artifact produced by one run.
pub fn run_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// `<app>_data_<stamp>.tar.gz`
pub fn archive_name(app: &str, stamp: &str) -> String {
    format!("{}_data_{}.tar.gz", app, stamp)
}

/// `<app>_<engine>_<stamp>.<ext>`
pub fn dump_name(app: &str, engine: &str, stamp: &str, ext: &str) -> String {
    format!("{}_{}_{}.{}", app, engine, stamp, ext)
}

/// Whether a file name is one of the app's data archives.
pub fn is_data_archive(file_name: &str, app: &str) -> bool {
    file_name.starts_with(&format!("{}_data_", app)) && file_name.ends_with(".tar.gz")
}

/// Whether a file name is one of the app's database dumps.
pub fn is_db_dump(file_name: &str, app: &str) -> bool {
    file_name.starts_with(&format!("{}_", app))
        && !is_data_archive(file_name, app)
        && (file_name.ends_with(".sql.gz") || file_name.ends_with(".archive.gz"))
}

/// Format bytes to human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
