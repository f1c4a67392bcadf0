// =============================================================================
// Audit — one JSONL record per cycle, the engine's flight recorder
// =============================================================================
//
// Every cycle appends a structured line to data/audit/audit-YYYYMMDD.jsonl:
// status, no-trade reason, regime, universe counts, triggers, proposals,
// approvals and rejections with reasons, orders, fills, per-stage latency,
// and the config hash the cycle ran under.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::execution::ExecutionReport;
use crate::signals::TriggerSignal;
use crate::strategies::TradeProposal;
use crate::types::{CycleOutcome, Regime};

#[derive(Debug, Clone, Serialize)]
pub struct UniverseAudit {
    pub eligible_per_tier: [usize; 3],
    pub excluded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleAudit {
    pub cycle_id: String,
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub status: CycleOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_trade_reason: Option<String>,
    pub regime: Regime,
    pub config_hash: String,
    pub universe: UniverseAudit,
    pub triggers: Vec<TriggerSignal>,
    pub proposals: Vec<TradeProposal>,
    pub approved: Vec<TradeProposal>,
    pub rejections: HashMap<String, Vec<String>>,
    pub executions: Vec<ExecutionReport>,
    pub fills_applied: u32,
    /// Wall-clock milliseconds per stage, in stage order.
    pub stage_latency_ms: BTreeMap<String, u64>,
    pub total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CycleAudit {
    pub fn begin(cycle_number: u64, regime: Regime, config_hash: &str) -> Self {
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            cycle_number,
            started_at: Utc::now(),
            status: CycleOutcome::NoTrade,
            no_trade_reason: None,
            regime,
            config_hash: config_hash.to_string(),
            universe: UniverseAudit { eligible_per_tier: [0, 0, 0], excluded: 0 },
            triggers: Vec::new(),
            proposals: Vec::new(),
            approved: Vec::new(),
            rejections: HashMap::new(),
            executions: Vec::new(),
            fills_applied: 0,
            stage_latency_ms: BTreeMap::new(),
            total_ms: 0,
            error: None,
        }
    }
}

/// Append-only daily-rotated JSONL writer.
pub struct AuditWriter {
    dir: PathBuf,
}

impl AuditWriter {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("audit"),
        }
    }

    fn file_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("audit-{}.jsonl", at.format("%Y%m%d")))
    }

    /// Append one record. Audit failures are logged, never fatal: a broken
    /// disk must not stop the trading loop.
    pub fn append(&self, record: &CycleAudit) {
        if let Err(e) = self.try_append(record) {
            warn!(error = %e, "audit append failed");
        }
    }

    fn try_append(&self, record: &CycleAudit) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.file_path(record.started_at);
        let mut line = serde_json::to_string(record).context("failed to serialise audit record")?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_roundtrips_through_jsonl() {
        let dir = std::env::temp_dir().join(format!("meridian-audit-{}", Uuid::new_v4()));
        let writer = AuditWriter::new(&dir);

        let mut record = CycleAudit::begin(7, Regime::Chop, "abcd1234");
        record.status = CycleOutcome::Trade;
        record.stage_latency_ms.insert("universe_build".into(), 120);
        record.stage_latency_ms.insert("risk_check".into(), 4);
        record.total_ms = 350;
        writer.append(&record);
        writer.append(&record);

        let path = writer.file_path(record.started_at);
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["status"], "TRADE");
        assert_eq!(parsed["cycle_number"], 7);
        assert_eq!(parsed["config_hash"], "abcd1234");
        assert_eq!(parsed["stage_latency_ms"]["universe_build"], 120);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn no_trade_reason_serialises_when_present() {
        let mut record = CycleAudit::begin(1, Regime::Crash, "x");
        record.no_trade_reason = Some("empty_universe".into());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["no_trade_reason"], "empty_universe");
        assert_eq!(json["regime"], "crash");
    }
}
