//! Behavioral firewall.
//!
//! Keeps a per-skill baseline (first seen, request counts, sliding window
//! of recent timestamps, endpoints seen) and evaluates every brokered
//! request against it: burst, rate spike, new endpoint, off-hours, and
//! scope-creep checks, in that order, accumulating reasons. Burst and
//! scope-creep block; the rest warn.
//!
//! Alert dispatch is asynchronous and can never change the decision.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::alerts::{AlertEvent, AlertSeverity, AlertSink};
use crate::storage::atomic_write_json;
use crate::{Error, Result};

const MINUTE_MS: i64 = 60_000;

/// Firewall tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirewallConfig {
    /// Requests before spike/new-endpoint checks arm.
    pub min_warmup_requests: u64,
    /// Spike threshold: last-minute rate vs lifetime average.
    pub rate_spike_multiplier: f64,
    /// Burst detection window in milliseconds.
    pub burst_window_ms: i64,
    /// Requests allowed inside the burst window.
    pub burst_limit: u32,
    /// Off-hours window start (local hour, 0-23).
    pub off_hours_start: u32,
    /// Off-hours window end (local hour, exclusive). Equal to start
    /// disables the check; start > end wraps across midnight.
    pub off_hours_end: u32,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            min_warmup_requests: 10,
            rate_spike_multiplier: 4.0,
            burst_window_ms: 10_000,
            burst_limit: 15,
            off_hours_start: 0,
            off_hours_end: 0,
        }
    }
}

/// Per-skill behavioral state. Lazily created, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillBaseline {
    /// First request ever seen from this skill.
    pub first_seen: DateTime<Utc>,
    /// Lifetime request count.
    pub total_requests: u64,
    /// Epoch-ms timestamps within max(burstWindow, 60 s).
    pub recent_timestamps: Vec<i64>,
    /// Endpoint URLs this skill has touched.
    pub seen_endpoints: BTreeSet<String>,
}

impl SkillBaseline {
    fn new(first_seen: DateTime<Utc>) -> Self {
        Self {
            first_seen,
            total_requests: 0,
            recent_timestamps: Vec::new(),
            seen_endpoints: BTreeSet::new(),
        }
    }
}

/// Decision severity, pre-mapping to alert severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Nothing noteworthy.
    Info,
    /// Suspicious but allowed.
    Warn,
    /// Blocked.
    Critical,
}

impl Severity {
    /// Map to the alert-channel severity vocabulary.
    #[must_use]
    pub fn to_alert(self) -> AlertSeverity {
        match self {
            Self::Info => AlertSeverity::Info,
            Self::Warn => AlertSeverity::Warning,
            Self::Critical => AlertSeverity::Critical,
        }
    }
}

/// One request as the firewall sees it.
#[derive(Debug, Clone)]
pub struct FirewallRequest<'a> {
    /// Acting skill.
    pub skill_id: &'a str,
    /// Target provider.
    pub provider: &'a str,
    /// Requested scope.
    pub scope: &'a str,
    /// Target endpoint URL.
    pub endpoint: &'a str,
    /// HTTP method.
    pub method: &'a str,
    /// Request time.
    pub timestamp: DateTime<Utc>,
    /// Set when the scope engine already denied this request.
    pub scope_denied: bool,
}

/// The firewall's verdict.
#[derive(Debug, Clone)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Highest severity reached.
    pub severity: Severity,
    /// Reasons, in evaluation order.
    pub reasons: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BaselineFile {
    skills: HashMap<String, SkillBaseline>,
}

/// Behavioral firewall with persisted per-skill baselines.
pub struct Firewall {
    config: FirewallConfig,
    path: PathBuf,
    baselines: DashMap<String, SkillBaseline>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl Firewall {
    /// Load baselines from `firewall.json` (missing file = fresh state).
    ///
    /// # Errors
    ///
    /// Fails when an existing file cannot be parsed.
    pub fn load(
        path: PathBuf,
        config: FirewallConfig,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Result<Self> {
        let baselines = DashMap::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: BaselineFile = serde_json::from_str(&raw)
                .map_err(|e| Error::Validation(format!("Malformed firewall state: {e}")))?;
            for (skill, baseline) in file.skills {
                baselines.insert(skill, baseline);
            }
        }
        debug!(skills = baselines.len(), "Firewall baselines loaded");
        Ok(Self {
            config,
            path,
            baselines,
            alerts,
        })
    }

    /// Evaluate one request, update the skill's baseline, persist, and
    /// (when anything fired) dispatch an alert.
    ///
    /// Persistence and alert failures are logged and swallowed; they never
    /// change the decision.
    pub fn evaluate(&self, request: &FirewallRequest<'_>) -> Decision {
        let now_ms = request.timestamp.timestamp_millis();
        let retention = self.config.burst_window_ms.max(MINUTE_MS);

        let mut reasons = Vec::new();
        let mut severity = Severity::Info;
        let mut allowed = true;

        {
            let mut baseline = self
                .baselines
                .entry(request.skill_id.to_string())
                .or_insert_with(|| SkillBaseline::new(request.timestamp));

            baseline.recent_timestamps.retain(|&t| t > now_ms - retention);
            baseline.recent_timestamps.push(now_ms);

            // 1. Burst: strictly more than burst_limit inside the window.
            let burst_count = baseline
                .recent_timestamps
                .iter()
                .filter(|&&t| t >= now_ms - self.config.burst_window_ms)
                .count() as u32;
            if burst_count > self.config.burst_limit {
                reasons.push("Burst threshold exceeded".to_string());
                severity = Severity::Critical;
                allowed = false;
            }

            let warmed = baseline.total_requests >= self.config.min_warmup_requests;

            // 2. Rate spike vs lifetime average.
            if warmed {
                let requests_last_minute = baseline
                    .recent_timestamps
                    .iter()
                    .filter(|&&t| t > now_ms - MINUTE_MS)
                    .count() as f64;
                let elapsed_minutes =
                    ((now_ms - baseline.first_seen.timestamp_millis()) as f64 / MINUTE_MS as f64)
                        .max(1.0);
                let average_rpm = baseline.total_requests as f64 / elapsed_minutes;
                if requests_last_minute > average_rpm * self.config.rate_spike_multiplier {
                    reasons.push("Request rate spike detected".to_string());
                    severity = severity.max(Severity::Warn);
                }
            }

            // 3. New endpoint after warmup.
            if warmed && !baseline.seen_endpoints.contains(request.endpoint) {
                reasons.push(format!("New endpoint access: {}", request.endpoint));
                severity = severity.max(Severity::Warn);
            }

            // 4. Off-hours activity (local time, half-open window).
            let local_hour = request.timestamp.with_timezone(&Local).hour();
            if hour_in_window(local_hour, self.config.off_hours_start, self.config.off_hours_end) {
                reasons.push("Off-hours activity".to_string());
                severity = severity.max(Severity::Warn);
            }

            // 5. Scope creep.
            if request.scope_denied {
                reasons.push("Scope violation attempt".to_string());
                severity = Severity::Critical;
                allowed = false;
            }

            baseline.seen_endpoints.insert(request.endpoint.to_string());
            baseline.total_requests += 1;
        }

        if let Err(e) = self.persist() {
            warn!(error = %e, "Failed to persist firewall baselines");
        }

        if !reasons.is_empty() {
            if let Some(alerts) = &self.alerts {
                alerts.dispatch(
                    AlertEvent::new(severity.to_alert(), "firewall", reasons.join("; "))
                        .with_skill(request.skill_id)
                        .with_details(serde_json::json!({
                            "provider": request.provider,
                            "scope": request.scope,
                            "endpoint": request.endpoint,
                            "method": request.method,
                            "allowed": allowed,
                        })),
                );
            }
        }

        Decision {
            allowed,
            severity,
            reasons,
        }
    }

    /// Read-only view of a skill's baseline.
    #[must_use]
    pub fn baseline(&self, skill_id: &str) -> Option<SkillBaseline> {
        self.baselines.get(skill_id).map(|b| b.value().clone())
    }

    fn persist(&self) -> Result<()> {
        let file = BaselineFile {
            skills: self
                .baselines
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
        };
        atomic_write_json(&self.path, &file)
    }
}

/// Half-open `[start, end)` hour check; equal bounds disable, start > end
/// wraps across midnight.
fn hour_in_window(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}
