// src/sweeper.rs
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::engine::ToilEngine;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Periodic duplicate-entry sweep over every known user. Races between
/// concurrent sessions can leave more than one synthetic entry per
/// (user, date, action); this loop is what brings the ledger back to the
/// at-most-one invariant.
pub async fn run_reconciliation_sweep(engine: Arc<ToilEngine>, interval: Duration) {
    info!(
        "Starting background reconciliation sweep (every {:?})",
        interval
    );
    loop {
        let user_ids = engine.user_ids().await;
        if user_ids.is_empty() {
            debug!("Reconciliation sweep has no users to check");
        }
        let mut total_removed = 0usize;
        for user_id in &user_ids {
            match engine.cleanup_duplicate_synthetic_entries(user_id).await {
                Ok(0) => {}
                Ok(removed) => {
                    info!(
                        "Reconciliation sweep removed {} duplicate entries for {}",
                        removed, user_id
                    );
                    total_removed += removed;
                }
                Err(e) => {
                    error!("Reconciliation sweep failed for {}: {}", user_id, e);
                }
            }
        }
        if total_removed > 0 {
            info!(
                "Reconciliation sweep pass finished: {} duplicates removed across {} users",
                total_removed,
                user_ids.len()
            );
        }
        sleep(interval).await;
    }
}
