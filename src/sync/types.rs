//! Result types of a sync cycle

use crate::ws::Nsu;
use serde::Serialize;
use std::collections::BTreeMap;

/// Error that ended a cycle early
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleError {
    /// Machine-readable kind (`network`, `transport_failure`, `service_rejected`, `repository`, ...)
    pub kind: String,
    pub detail: String,
}

/// Outcome of one sync cycle for one company.
///
/// Always complete, even when the cycle failed part-way: counts reflect what was persisted before
/// the failure and `final_cursor` what was saved.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub ok: bool,
    /// Documents persisted, batch items and backfilled items together
    pub processed_count: usize,
    /// Documents persisted through targeted NSU pulls
    pub backfilled: usize,
    /// Items skipped because their payload could not be decoded
    pub skipped: usize,
    /// Missing NSUs detected this cycle that no targeted pull recovered
    pub gaps_remaining: usize,
    pub final_cursor: Nsu,
    pub final_max_cursor: Nsu,
    pub per_schema_counts: BTreeMap<String, usize>,
    pub exchanges: u32,
    pub stopped: bool,
    pub stop_reason: Option<String>,
    pub resume_after_secs: Option<u64>,
    pub error: Option<CycleError>,
    pub warnings: Vec<String>,
}

impl SyncSummary {
    pub fn new(cursor: Nsu, max_cursor: Nsu) -> Self {
        Self {
            ok: true,
            processed_count: 0,
            backfilled: 0,
            skipped: 0,
            gaps_remaining: 0,
            final_cursor: cursor,
            final_max_cursor: max_cursor,
            per_schema_counts: BTreeMap::new(),
            exchanges: 0,
            stopped: false,
            stop_reason: None,
            resume_after_secs: None,
            error: None,
            warnings: Vec::new(),
        }
    }

    /// Count one persisted document of schema `label`
    pub fn record(&mut self, label: &str) {
        self.processed_count += 1;
        *self.per_schema_counts.entry(label.to_string()).or_insert(0) += 1;
    }

    /// Mark the cycle as failed
    pub fn fail(&mut self, kind: impl Into<String>, detail: impl Into<String>) {
        self.ok = false;
        self.error = Some(CycleError {
            kind: kind.into(),
            detail: detail.into(),
        });
    }

    /// Get a human-readable summary of the cycle
    pub fn describe(&self) -> String {
        let mut out = format!(
            "{} documents ({} backfilled, {} skipped), cursor {} of {}",
            self.processed_count,
            self.backfilled,
            self.skipped,
            self.final_cursor,
            self.final_max_cursor
        );
        if let Some(reason) = &self.stop_reason {
            out.push_str(&format!(", stopped: {reason}"));
        }
        if let Some(error) = &self.error {
            out.push_str(&format!(", error {}: {}", error.kind, error.detail));
        }
        out
    }
}
