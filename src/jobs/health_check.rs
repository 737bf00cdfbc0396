//! Background job: probe every service endpoint and record its health.
//!
//! A sweep probes each service that has an endpoint and writes the status
//! only when it changed. A failed probe or write for one service is logged
//! and the sweep moves on.
//!
//! A probe can take seconds. The record is read again before writing, and a
//! status set by someone else in the meantime (for example the admin API) is
//! kept; the next sweep re-probes it. The re-read and the write are not
//! atomic, so a write landing between them is still overwritten.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;

use crate::models::service::{HealthStatus, ServicePatch};
use crate::proxy::upstream::{Dispatcher, UpstreamTarget};
use crate::store::RegistryStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub probed: usize,
    pub changed: usize,
    pub failed: usize,
}

/// Spawn the health checker. Call this once at startup.
pub fn spawn(store: Arc<dyn RegistryStore>, dispatcher: Arc<dyn Dispatcher>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let summary = sweep(store.as_ref(), dispatcher.as_ref()).await;
            if summary.changed > 0 || summary.failed > 0 {
                tracing::info!(
                    probed = summary.probed,
                    changed = summary.changed,
                    failed = summary.failed,
                    "health sweep finished"
                );
            }
        }
    });
}

pub async fn sweep(store: &dyn RegistryStore, dispatcher: &dyn Dispatcher) -> SweepSummary {
    let mut summary = SweepSummary::default();

    let services = match store.list().await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("health sweep could not list services: {}", e);
            summary.failed += 1;
            return summary;
        }
    };

    for record in services {
        let Ok(target) = UpstreamTarget::from_record(&record) else {
            continue;
        };
        summary.probed += 1;

        let status = dispatcher.probe(&target).await;
        if status == record.health_status {
            continue;
        }

        match store.get(&record.name).await {
            Ok(current) if current.health_status != record.health_status => {
                tracing::debug!(
                    service = %record.name,
                    status = current.health_status.as_str(),
                    "health changed during probe, keeping it"
                );
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                summary.failed += 1;
                tracing::error!(service = %record.name, "failed to re-read service: {}", e);
                continue;
            }
        }

        let patch = ServicePatch {
            health_status: Some(status),
            ..Default::default()
        };
        match store.update(&record.name, patch).await {
            Ok(_) => {
                summary.changed += 1;
                if status == HealthStatus::Down {
                    tracing::warn!(service = %record.name, from = record.health_status.as_str(), "service is down");
                } else {
                    tracing::info!(
                        service = %record.name,
                        from = record.health_status.as_str(),
                        to = status.as_str(),
                        "health status changed"
                    );
                }
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(service = %record.name, "failed to record health status: {}", e);
            }
        }
    }

    summary
}
