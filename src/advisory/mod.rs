//! Security-advisory feed poller.
//!
//! A background collaborator: fetches configured JSON feeds on an
//! interval, de-duplicates advisories by id against `advisory-state.json`,
//! audits each new one as `advisory.processed`, and raises alerts for
//! high-severity entries. Fetch failures are logged and swallowed — the
//! poller never disturbs the core.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alerts::{AlertEvent, AlertSeverity, AlertSink};
use crate::audit::{AuditContext, AuditEvent, AuditLog};
use crate::storage::atomic_write_json;
use crate::{Error, Result};

/// One advisory as published by a feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advisory {
    /// Stable advisory id (the de-dup key).
    pub id: String,
    /// `low`, `medium`, `high`, or `critical`.
    #[serde(default)]
    pub severity: String,
    /// Short title.
    #[serde(default)]
    pub title: String,
    /// Affected provider, when the feed names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvisoryState {
    seen_ids: Vec<String>,
}

/// Polls advisory feeds and fans out audit entries and alerts.
pub struct AdvisoryPoller {
    path: PathBuf,
    feeds: Vec<String>,
    client: reqwest::Client,
    audit: Arc<AuditLog>,
    alerts: Option<Arc<dyn AlertSink>>,
    seen: Mutex<Vec<String>>,
}

impl AdvisoryPoller {
    /// Load seen-id state from `advisory-state.json`.
    ///
    /// # Errors
    ///
    /// Fails when an existing state file cannot be parsed.
    pub fn load(
        path: PathBuf,
        feeds: Vec<String>,
        audit: Arc<AuditLog>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Result<Self> {
        let seen = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let state: AdvisoryState = serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("Malformed advisory state: {e}")))?;
            state.seen_ids
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            feeds,
            client: reqwest::Client::new(),
            audit,
            alerts,
            seen: Mutex::new(seen),
        })
    }

    /// Fetch every feed once, processing advisories not seen before.
    /// Returns how many new advisories were processed.
    pub async fn poll_once(&self) -> usize {
        let mut processed = 0usize;
        for feed in &self.feeds {
            let advisories = match self.fetch_feed(feed).await {
                Ok(advisories) => advisories,
                Err(e) => {
                    warn!(feed = %feed, error = %e, "Advisory feed fetch failed");
                    continue;
                }
            };
            for advisory in advisories {
                if self.seen.lock().contains(&advisory.id) {
                    continue;
                }
                if let Err(e) = self.process(&advisory).await {
                    warn!(id = %advisory.id, error = %e, "Failed to process advisory");
                    continue;
                }
                self.seen.lock().push(advisory.id.clone());
                processed += 1;
            }
        }
        if processed > 0 {
            if let Err(e) = self.persist() {
                warn!(error = %e, "Failed to persist advisory state");
            }
        }
        processed
    }

    async fn fetch_feed(&self, feed: &str) -> Result<Vec<Advisory>> {
        let response = self
            .client
            .get(feed)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("Feed unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "Feed returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("Malformed feed payload: {e}")))
    }

    async fn process(&self, advisory: &Advisory) -> Result<()> {
        info!(id = %advisory.id, severity = %advisory.severity, "Processing advisory");
        self.audit
            .append(
                AuditEvent::AdvisoryProcessed,
                AuditContext {
                    provider: advisory.provider.clone(),
                    outcome: Some("processed".into()),
                    details: Some(format!(
                        "{} severity={} {}",
                        advisory.id, advisory.severity, advisory.title
                    )),
                    ..AuditContext::default()
                },
            )
            .await?;

        if let Some(alerts) = &self.alerts {
            let severity = match advisory.severity.as_str() {
                "critical" => AlertSeverity::Critical,
                "high" => AlertSeverity::Warning,
                _ => AlertSeverity::Info,
            };
            alerts.dispatch(
                AlertEvent::new(severity, "advisory", advisory.title.clone())
                    .with_details(serde_json::json!({ "id": advisory.id })),
            );
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let state = AdvisoryState {
            seen_ids: self.seen.lock().clone(),
        };
        atomic_write_json(&self.path, &state)
    }
}

/// Spawn the polling loop; exits when the shutdown receiver fires.
pub fn spawn_poller(
    poller: Arc<AdvisoryPoller>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let processed = poller.poll_once().await;
                    if processed > 0 {
                        debug!(count = processed, "Advisories processed");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Advisory poller shutting down");
                    break;
                }
            }
        }
    });
}
