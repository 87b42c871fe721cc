pub mod backup;
pub mod capture;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod notify;
pub mod remote;
pub mod restore;
pub mod runner;

pub use backup::BackupJob;
pub use config::GlobalConfig;
pub use notify::Notifier;
pub use restore::RestoreOrchestrator;
pub use runner::SystemRunner;
