//! Alert routing.
//!
//! The core only ever emits [`AlertEvent`]s through an injected
//! [`AlertSink`]; delivery is fire-and-forget and a failing channel can
//! never affect the decision that produced the alert.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Alert severity, ordered so channels can filter on a minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational (e.g. an identity verification succeeded).
    Info,
    /// Suspicious but allowed.
    Warning,
    /// Blocked or security-relevant.
    Critical,
}

/// A single alert emitted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    /// Severity level.
    pub severity: AlertSeverity,
    /// Emitting subsystem (`firewall`, `identity`, `advisory`).
    pub source: String,
    /// Human-readable message.
    pub message: String,
    /// Skill involved, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Structured extras.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AlertEvent {
    /// Build an alert stamped with the current time.
    #[must_use]
    pub fn new(severity: AlertSeverity, source: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            source: source.to_string(),
            message: message.into(),
            skill_id: None,
            timestamp: Utc::now(),
            details: None,
        }
    }

    /// Attach the acting skill.
    #[must_use]
    pub fn with_skill(mut self, skill_id: impl Into<String>) -> Self {
        self.skill_id = Some(skill_id.into());
        self
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Where alerts go. Implementations must swallow their own failures.
pub trait AlertSink: Send + Sync + 'static {
    /// Dispatch an alert. Must not block the caller and must not fail.
    fn dispatch(&self, event: AlertEvent);
}

/// A configured webhook destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertChannel {
    /// Webhook URL receiving alert JSON via POST.
    pub url: String,
    /// Lowest severity this channel wants.
    #[serde(default = "default_min_severity")]
    pub min_severity: AlertSeverity,
}

fn default_min_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

/// Routes alerts to webhook channels filtered by minimum severity.
pub struct WebhookAlertRouter {
    client: reqwest::Client,
    channels: Vec<AlertChannel>,
}

impl WebhookAlertRouter {
    /// Build a router over the configured channels.
    #[must_use]
    pub fn new(channels: Vec<AlertChannel>) -> Arc<Self> {
        Arc::new(Self {
            client: reqwest::Client::new(),
            channels,
        })
    }
}

impl AlertSink for WebhookAlertRouter {
    fn dispatch(&self, event: AlertEvent) {
        for channel in &self.channels {
            if event.severity < channel.min_severity {
                continue;
            }
            let client = self.client.clone();
            let url = channel.url.clone();
            let event = event.clone();
            tokio::spawn(async move {
                match client.post(&url).json(&event).send().await {
                    Ok(response) if response.status().is_success() => {
                        debug!(url = %url, severity = ?event.severity, "Alert delivered");
                    }
                    Ok(response) => {
                        warn!(url = %url, status = %response.status(), "Alert webhook rejected");
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "Alert webhook unreachable");
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_for_filtering() {
        assert!(AlertSeverity::Info < AlertSeverity::Warning);
        assert!(AlertSeverity::Warning < AlertSeverity::Critical);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AlertSeverity::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&AlertSeverity::Warning).unwrap(),
            "\"warning\""
        );
        assert_eq!(serde_json::to_string(&AlertSeverity::Info).unwrap(), "\"info\"");
    }

    #[test]
    fn builder_attaches_context() {
        let event = AlertEvent::new(AlertSeverity::Warning, "firewall", "spike")
            .with_skill("skill.alpha")
            .with_details(serde_json::json!({ "rpm": 120 }));
        assert_eq!(event.skill_id.as_deref(), Some("skill.alpha"));
        assert!(event.details.is_some());
    }

    #[tokio::test]
    async fn dispatch_to_unreachable_channel_does_not_panic() {
        let router = WebhookAlertRouter::new(vec![AlertChannel {
            url: "http://127.0.0.1:1/alerts".to_string(),
            min_severity: AlertSeverity::Info,
        }]);
        router.dispatch(AlertEvent::new(AlertSeverity::Critical, "firewall", "test"));
        // Give the spawned task a moment; the point is that nothing here fails.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
