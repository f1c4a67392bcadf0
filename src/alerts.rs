// =============================================================================
// Alert Pipeline — fingerprint-based dedupe with one-shot escalation
// =============================================================================
//
// Identical alerts (same severity|title|message) within the 60-second dedupe
// window collapse into one outbound notification. An alert left unresolved
// past `escalation_seconds` is re-sent exactly once with boosted severity;
// after that it stays silent until resolved or stale.
//
// Webhook delivery is fire-and-forget on a spawned task with a short timeout
// so a slow webhook can never block the trading cycle.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::config::AlertConfig;

const MAX_OUTBOUND_HISTORY: usize = 100;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    /// One level up; CRITICAL stays CRITICAL.
    pub fn boosted(self) -> Self {
        match self {
            Self::Info => Self::Warning,
            Self::Warning | Self::Critical => Self::Critical,
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub fingerprint: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub first_seen: DateTime<Utc>,
    /// Start of the current dedupe window (resets after window expiry).
    pub window_start: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub escalated: bool,
}

/// An actually-sent notification (outbound history for tests/status).
#[derive(Debug, Clone, Serialize)]
pub struct SentAlert {
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Result of a notify call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent,
    Deduped,
    Escalated,
}

// ---------------------------------------------------------------------------
// The pipeline
// ---------------------------------------------------------------------------

pub struct AlertPipeline {
    cfg: AlertConfig,
    records: Mutex<HashMap<String, AlertRecord>>,
    outbound: Mutex<Vec<SentAlert>>,
    http: reqwest::Client,
}

impl AlertPipeline {
    pub fn new(cfg: AlertConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("failed to build webhook client");
        Self {
            cfg,
            records: Mutex::new(HashMap::new()),
            outbound: Mutex::new(Vec::new()),
            http,
        }
    }

    /// fingerprint = SHA256(severity|title|message)
    pub fn fingerprint(severity: AlertSeverity, title: &str, message: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{severity}|{title}|{message}"));
        hex::encode(hasher.finalize())
    }

    pub fn notify(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context: serde_json::Value,
    ) -> NotifyOutcome {
        self.notify_at(Utc::now(), severity, title, message, context)
    }

    /// Clock-injected variant so the window/escalation logic is testable.
    pub fn notify_at(
        &self,
        now: DateTime<Utc>,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context: serde_json::Value,
    ) -> NotifyOutcome {
        self.sweep_stale(now);
        let fp = Self::fingerprint(severity, title, message);

        let mut records = self.records.lock();
        let dedupe_window = chrono::Duration::seconds(self.cfg.dedupe_window_seconds as i64);
        let escalation_after = chrono::Duration::seconds(self.cfg.escalation_seconds as i64);

        match records.get_mut(&fp) {
            None => {
                records.insert(
                    fp.clone(),
                    AlertRecord {
                        fingerprint: fp,
                        severity,
                        title: title.to_string(),
                        message: message.to_string(),
                        first_seen: now,
                        window_start: now,
                        last_seen: now,
                        count: 1,
                        escalated: false,
                    },
                );
                drop(records);
                self.send(severity, title, message, &context, false);
                NotifyOutcome::Sent
            }
            Some(rec) => {
                rec.last_seen = now;
                rec.count += 1;

                if !rec.escalated && now - rec.first_seen >= escalation_after {
                    rec.escalated = true;
                    let boosted = rec.severity.boosted();
                    let esc_title = format!("ESCALATED: {}", rec.title);
                    let esc_message = format!(
                        "{} (unresolved for {}s, {} occurrences)",
                        rec.message,
                        (now - rec.first_seen).num_seconds(),
                        rec.count
                    );
                    drop(records);
                    self.send(boosted, &esc_title, &esc_message, &context, true);
                    return NotifyOutcome::Escalated;
                }

                if rec.escalated {
                    // Escalated alerts keep deduping until resolved or stale.
                    return NotifyOutcome::Deduped;
                }

                if now - rec.window_start < dedupe_window {
                    return NotifyOutcome::Deduped;
                }

                // Window expired: send again and open a fresh window.
                rec.window_start = now;
                drop(records);
                self.send(severity, title, message, &context, false);
                NotifyOutcome::Sent
            }
        }
    }

    /// Escalation sweep for alerts that stay active without new notify
    /// calls. The orchestrator runs this once per cycle.
    pub fn tick(&self, now: DateTime<Utc>) {
        self.sweep_stale(now);
        let escalation_after = chrono::Duration::seconds(self.cfg.escalation_seconds as i64);

        let pending: Vec<(AlertSeverity, String, String)> = {
            let mut records = self.records.lock();
            let mut out = Vec::new();
            for rec in records.values_mut() {
                if !rec.escalated && now - rec.first_seen >= escalation_after {
                    rec.escalated = true;
                    out.push((
                        rec.severity.boosted(),
                        format!("ESCALATED: {}", rec.title),
                        format!(
                            "{} (unresolved for {}s, {} occurrences)",
                            rec.message,
                            (now - rec.first_seen).num_seconds(),
                            rec.count
                        ),
                    ));
                }
            }
            out
        };

        for (severity, title, message) in pending {
            self.send(severity, &title, &message, &serde_json::Value::Null, true);
        }
    }

    /// Explicit resolution removes the record, enabling a fresh cycle.
    pub fn resolve(&self, fingerprint: &str) -> bool {
        let removed = self.records.lock().remove(fingerprint).is_some();
        if removed {
            info!(fingerprint, "alert resolved");
        }
        removed
    }

    pub fn active_records(&self) -> Vec<AlertRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// Notifications actually sent (deduped calls are absent).
    pub fn outbound_history(&self) -> Vec<SentAlert> {
        self.outbound.lock().clone()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn sweep_stale(&self, now: DateTime<Utc>) {
        let stale_after = chrono::Duration::seconds(self.cfg.stale_seconds as i64);
        self.records
            .lock()
            .retain(|_, rec| now - rec.last_seen < stale_after);
    }

    fn send(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        context: &serde_json::Value,
        escalation: bool,
    ) {
        match severity {
            AlertSeverity::Info => info!(title, message, "ALERT"),
            AlertSeverity::Warning => warn!(title, message, "ALERT"),
            AlertSeverity::Critical => error!(title, message, "ALERT"),
        }

        {
            let mut outbound = self.outbound.lock();
            outbound.push(SentAlert {
                severity,
                title: title.to_string(),
                message: message.to_string(),
                at: Utc::now(),
            });
            while outbound.len() > MAX_OUTBOUND_HISTORY {
                outbound.remove(0);
            }
        }

        let url = if escalation {
            self.cfg
                .escalation_webhook_url
                .clone()
                .or_else(|| self.cfg.webhook_url.clone())
        } else {
            self.cfg.webhook_url.clone()
        };

        if let Some(url) = url {
            let payload = serde_json::json!({
                "severity": severity.to_string(),
                "title": title,
                "message": message,
                "context": context,
            });
            let client = self.http.clone();
            tokio::spawn(async move {
                if let Err(e) = client.post(&url).json(&payload).send().await {
                    warn!(error = %e, "alert webhook delivery failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for AlertPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertPipeline")
            .field("active", &self.records.lock().len())
            .finish()
    }
}
