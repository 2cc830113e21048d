//! Reconciliation loop
//!
//! Periodically retries cleanup that could not finish inline: provider
//! resources and edge changes left behind by failed compensations, and
//! deletes that stopped half way.

use crate::certs::CertificateManager;
use crate::lifecycle::VpsManager;
use crate::state::StateManager;
use nimbus_common::{InstanceState, Result};
use nimbus_provider::{DeleteOutcome, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counts from one pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphans_cleared: usize,
    pub orphans_remaining: usize,
    pub deletes_finished: usize,
    pub edge_leftovers_cleared: usize,
    pub edge_leftovers_remaining: usize,
}

pub struct Reconciler {
    state: StateManager,
    providers: ProviderRegistry,
    vps: Arc<VpsManager>,
    certs: Option<Arc<CertificateManager>>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        state: StateManager,
        providers: ProviderRegistry,
        vps: Arc<VpsManager>,
        certs: Option<Arc<CertificateManager>>,
        interval: Duration,
    ) -> Self {
        Self {
            state,
            providers,
            vps,
            certs,
            interval,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Reconciler started (every {:?})", self.interval);

        loop {
            match self.reconcile_all().await {
                Ok(report) if report != ReconcileReport::default() => {
                    info!(?report, "Reconciliation pass complete")
                }
                Ok(_) => debug!("Reconciliation pass: nothing to do"),
                Err(e) => error!("Reconciliation error: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Reconciler stopped");
    }

    pub async fn reconcile_all(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.reconcile_orphans(&mut report).await?;
        self.finish_deletes(&mut report).await?;
        if let Some(certs) = &self.certs {
            let (cleared, remaining) = certs.reconcile_leftovers().await?;
            report.edge_leftovers_cleared = cleared;
            report.edge_leftovers_remaining = remaining;
        }
        Ok(report)
    }

    async fn reconcile_orphans(&self, report: &mut ReconcileReport) -> Result<()> {
        for mut marker in self.state.list_orphans()? {
            let provider = match self.providers.get(Some(&marker.provider)) {
                Ok(p) => p,
                Err(e) => {
                    warn!(provider_id = %marker.provider_id, "Skipping orphan: {}", e);
                    report.orphans_remaining += 1;
                    continue;
                }
            };

            match provider.delete_instance(&marker.provider_id).await {
                Ok(outcome) => {
                    if outcome == DeleteOutcome::AlreadyGone {
                        debug!(provider_id = %marker.provider_id, "Orphan already gone");
                    }
                    self.state
                        .clear_orphan(&marker.provider, &marker.provider_id)?;
                    info!(
                        provider_id = %marker.provider_id,
                        name = %marker.instance_name,
                        "Orphaned instance cleaned up"
                    );
                    report.orphans_cleared += 1;
                }
                Err(e) => {
                    marker.attempts += 1;
                    marker.reason = e.to_string();
                    self.state.record_orphan(&marker)?;
                    warn!(
                        provider_id = %marker.provider_id,
                        attempts = marker.attempts,
                        "Orphan cleanup failed: {}",
                        e
                    );
                    report.orphans_remaining += 1;
                }
            }
        }
        Ok(())
    }

    async fn finish_deletes(&self, report: &mut ReconcileReport) -> Result<()> {
        let stuck = self
            .state
            .list_instances()?
            .into_iter()
            .filter(|r| r.state == InstanceState::Deleting);

        for record in stuck {
            match self.vps.delete_vps(&record.id).await {
                Ok(()) => report.deletes_finished += 1,
                Err(e) => warn!(instance_id = %record.id, "Delete still failing: {}", e),
            }
        }
        Ok(())
    }
}
