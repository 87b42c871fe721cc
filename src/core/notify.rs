/// Webhook notifications for job lifecycle events.
use chrono::{DateTime, Utc};
use serde::Serialize;

use anyhow::Result;

use crate::core::config::GlobalConfig;
use crate::utils::WEBHOOK_TIMEOUT;

/// Event severity carried in the webhook payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Serialize)]
struct WebhookEvent<'a> {
    app: &'a str,
    message: &'a str,
    severity: Severity,
    host: &'a str,
    timestamp: DateTime<Utc>,
}

/// Fire-and-forget notification gateway. Delivery problems are reported and
/// swallowed; a webhook must never block or fail a job.
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    host_id: String,
}

impl Notifier {
    pub fn new(cfg: &GlobalConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            webhook_url: cfg.webhook_url.clone(),
            host_id: cfg.host_id.clone(),
        })
    }

    pub async fn send(&self, app: &str, severity: Severity, message: &str) {
        let url = match &self.webhook_url {
            Some(url) => url,
            None => return,
        };
        let event = WebhookEvent {
            app,
            message,
            severity,
            host: &self.host_id,
            timestamp: Utc::now(),
        };
        match self.client.post(url).json(&event).send().await {
            Ok(response) if !response.status().is_success() => {
                println!("⚠ webhook returned {}", response.status());
            }
            Ok(_) => {}
            Err(err) => println!("⚠ webhook delivery failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_shape() {
        let event = WebhookEvent {
            app: "vaultwarden",
            message: "Backup completed",
            severity: Severity::Success,
            host: "nas-01",
            timestamp: "2025-08-21T13:45:01Z".parse().unwrap(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["app"], "vaultwarden");
        assert_eq!(value["severity"], "success");
        assert_eq!(value["host"], "nas-01");
        assert_eq!(value["message"], "Backup completed");
        assert!(value["timestamp"].as_str().unwrap().starts_with("2025-08-21T13:45:01"));
    }

    #[test]
    fn test_severity_labels() {
        for (severity, label) in [
            (Severity::Info, "\"info\""),
            (Severity::Success, "\"success\""),
            (Severity::Warning, "\"warning\""),
            (Severity::Error, "\"error\""),
        ] {
            assert_eq!(serde_json::to_string(&severity).unwrap(), label);
        }
    }

    #[tokio::test]
    async fn test_send_without_url_is_a_no_op() {
        let cfg = GlobalConfig {
            apps_root: "/opt/stacks".into(),
            backup_root: "/var/backups/stackbak".into(),
            host_id: "nas-01".to_string(),
            remote: None,
            webhook_url: None,
            timeouts: Default::default(),
        };
        let notifier = Notifier::new(&cfg).unwrap();
        // Must return without attempting any network traffic.
        notifier.send("vw", Severity::Info, "noop").await;
    }
}
