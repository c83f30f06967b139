//! Sync orchestrator: drives one company's distribution cycle end to end.
//!
//! The orchestrator loads (or creates) the company cursor, runs the [`CursorProtocol`] until it
//! stops, and for every batch:
//! - stores each decodable item through the XML storage and the document repository
//! - counts persisted items per schema
//! - advances and saves the cursor (monotonically)
//! - backfills the NSU gaps of the batch with targeted pulls, bounded per cycle by the [`GapTracker`]
//!
//! Errors never escape `run`: they are folded into the returned [`SyncSummary`].

use crate::config::DfeConfig;
use crate::sync::cursor_protocol::{CursorProtocol, PullConfig, PullStep};
use crate::sync::gap_tracker::GapTracker;
use crate::sync::repositories::{
    CompanyId, Cursor, DocumentRecord, DocumentRepository, RepositoryError, XmlStorage,
};
use crate::sync::types::SyncSummary;
use crate::utils::only_digits;
use crate::ws::{DistributedItem, DistributionGateway, Nsu, ServiceStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Drives sync cycles against a distribution gateway and the persistence collaborators.
pub struct SyncOrchestrator {
    gateway: Arc<dyn DistributionGateway>,
    repository: Arc<dyn DocumentRepository>,
    storage: Arc<dyn XmlStorage>,

    // Configuration
    pull: PullConfig,
    backfill_cap: usize,
    idle_cooldown: Duration,
}

impl SyncOrchestrator {
    pub fn new(
        gateway: Arc<dyn DistributionGateway>,
        repository: Arc<dyn DocumentRepository>,
        storage: Arc<dyn XmlStorage>,
        config: &DfeConfig,
    ) -> Self {
        Self {
            gateway,
            repository,
            storage,
            pull: PullConfig::from(config),
            backfill_cap: config.backfill_cap,
            idle_cooldown: config.idle_cooldown,
        }
    }

    /// Load the company cursor, creating it at NSU zero on first use.
    pub async fn ensure_cursor(&self, company_id: CompanyId) -> Result<Cursor, RepositoryError> {
        if let Some(cursor) = self.repository.load_cursor(company_id).await? {
            return Ok(cursor);
        }
        let cursor = Cursor::new(Utc::now());
        self.repository.save_cursor(company_id, &cursor).await?;
        info!("Created cursor for company {}", company_id);
        Ok(cursor)
    }

    /// Run one sync cycle for a company.
    ///
    /// # Arguments
    /// * `company_id` - Persistence key of the company.
    /// * `tax_id` - Company tax id (punctuation is ignored).
    ///
    /// # Returns
    /// A complete `SyncSummary`; failures are reported in it rather than returned.
    pub async fn run(&self, company_id: CompanyId, tax_id: &str) -> SyncSummary {
        let tax_id = only_digits(tax_id);

        let mut cursor = match self.ensure_cursor(company_id).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let mut summary = SyncSummary::new(Nsu::ZERO, Nsu::ZERO);
                summary.fail("repository", e.to_string());
                return summary;
            }
        };
        let mut summary = SyncSummary::new(cursor.last_acknowledged_nsu, cursor.last_known_max_nsu);

        info!(
            "Starting sync cycle for company {} from NSU {}",
            company_id, cursor.last_acknowledged_nsu
        );

        let mut gaps = GapTracker::new(self.backfill_cap);
        let mut protocol = CursorProtocol::new(
            self.gateway.as_ref(),
            &self.pull,
            &tax_id,
            cursor.last_acknowledged_nsu,
        );

        while let Some(step) = protocol.next_step().await {
            let result = match step {
                PullStep::Batch {
                    items,
                    cursor_before,
                    cursor_after,
                    max_cursor,
                    caught_up,
                    ..
                } => {
                    let nsus: Vec<Nsu> = items.iter().map(|i| i.nsu).collect();
                    debug!(
                        "Batch of {} items, NSU {} -> {} (max {})",
                        items.len(),
                        cursor_before,
                        cursor_after,
                        max_cursor
                    );

                    async {
                        self.persist_items(company_id, &tax_id, items, &mut summary)
                            .await?;

                        cursor.advance(cursor_after, max_cursor, Utc::now());
                        cursor.resume_after =
                            caught_up.then(|| Utc::now() + chrono_duration(self.idle_cooldown));
                        self.repository.save_cursor(company_id, &cursor).await?;

                        self.backfill(
                            company_id,
                            &tax_id,
                            cursor_before,
                            &nsus,
                            &mut gaps,
                            &mut summary,
                        )
                        .await
                    }
                    .await
                }
                PullStep::CaughtUp {
                    cursor: returned,
                    max_cursor,
                    ..
                } => {
                    cursor.advance(returned, max_cursor, Utc::now());
                    cursor.resume_after = Some(Utc::now() + chrono_duration(self.idle_cooldown));
                    self.repository.save_cursor(company_id, &cursor).await
                }
                PullStep::Stopped {
                    reason,
                    status_code,
                    status_reason,
                    cursor: returned,
                    max_cursor,
                    resume_after,
                } => {
                    info!(
                        "Cycle for company {} stopped: {} (cStat {:?} {})",
                        company_id,
                        reason.as_str(),
                        status_code,
                        status_reason
                    );
                    summary.stopped = true;
                    summary.stop_reason = Some(reason.as_str().to_string());
                    summary.resume_after_secs = resume_after.map(|d| d.as_secs());

                    cursor.advance(returned, max_cursor, Utc::now());
                    cursor.resume_after = resume_after.map(|d| Utc::now() + chrono_duration(d));
                    self.repository.save_cursor(company_id, &cursor).await
                }
                PullStep::Failed { kind, detail, .. } => {
                    warn!("Cycle for company {} failed: {} {}", company_id, kind, detail);
                    summary.fail(kind, detail);
                    Ok(())
                }
            };

            if let Err(e) = result {
                warn!("Persistence failed for company {}: {}", company_id, e);
                summary.fail("repository", e.to_string());
                break;
            }
        }

        summary.exchanges = protocol.exchanges();
        summary.final_cursor = cursor.last_acknowledged_nsu;
        summary.final_max_cursor = cursor.last_known_max_nsu;
        summary.gaps_remaining = gaps.remaining();

        info!(
            "Sync cycle for company {} finished: {}",
            company_id,
            summary.describe()
        );
        summary
    }

    /// Persist decodable items; undecodable ones are skipped with a warning.
    async fn persist_items(
        &self,
        company_id: CompanyId,
        tax_id: &str,
        items: Vec<DistributedItem>,
        summary: &mut SyncSummary,
    ) -> Result<(), RepositoryError> {
        for item in items {
            let document_key = item.document_key();
            let bytes = match item.content {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Skipping NSU {}: {}", item.nsu, e);
                    summary.skipped += 1;
                    summary.warnings.push(format!("NSU {}: {}", item.nsu, e));
                    continue;
                }
            };

            let storage_reference = self
                .storage
                .save_xml(tax_id, &item.nsu.to_string(), &item.schema, &bytes)
                .await?;
            self.repository
                .save_document(DocumentRecord {
                    company_id,
                    nsu: item.nsu,
                    schema: item.schema.clone(),
                    schema_kind: item.kind.clone(),
                    document_key,
                    storage_reference,
                    received_at: Utc::now(),
                })
                .await?;
            summary.record(item.kind.label());
        }
        Ok(())
    }

    /// Targeted pulls for the gaps of one batch, within what is left of the cycle budget.
    async fn backfill(
        &self,
        company_id: CompanyId,
        tax_id: &str,
        previous: Nsu,
        batch: &[Nsu],
        gaps: &mut GapTracker,
        summary: &mut SyncSummary,
    ) -> Result<(), RepositoryError> {
        for nsu in gaps.plan(previous, batch) {
            tokio::time::sleep(self.pull.inter_call_delay).await;

            let response = match self.gateway.pull_nsu(tax_id, nsu).await {
                Ok(response) => response,
                Err(e) => {
                    summary
                        .warnings
                        .push(format!("backfill of NSU {nsu} failed: {e}"));
                    gaps.halt();
                    break;
                }
            };

            match response.status() {
                ServiceStatus::Outage | ServiceStatus::Throttled => {
                    summary.warnings.push(format!(
                        "backfill of NSU {} stopped: cStat {} {}",
                        nsu, response.status_code, response.status_reason
                    ));
                    gaps.halt();
                    break;
                }
                _ if response.items.is_empty() => {
                    debug!(
                        "NSU {} not available: cStat {} {}",
                        nsu, response.status_code, response.status_reason
                    );
                }
                _ => {
                    let before = summary.processed_count;
                    self.persist_items(company_id, tax_id, response.items, summary)
                        .await?;
                    summary.backfilled += summary.processed_count - before;
                    gaps.complete();
                }
            }
        }
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(3650))
}
