//! Statistics aggregator
//!
//! Rebuilds the `user_statistics` rows from charged operations. Every run
//! recomputes from scratch, so it can be repeated or interrupted at any point.

use medialab_core::{models::UserStatistics, traits::LedgerStore, AppResult};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Summary of one aggregation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationReport {
    /// Users whose row was written
    pub users: usize,
    /// Charged operations folded into those rows
    pub operations: i64,
}

pub struct StatisticsAggregator<S: LedgerStore> {
    store: Arc<S>,
    interval: Duration,
}

impl<S: LedgerStore> StatisticsAggregator<S> {
    pub fn new(store: Arc<S>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Recompute and upsert statistics for every user with a charged operation
    ///
    /// # Returns
    ///
    /// Number of users and operations aggregated
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> AppResult<AggregationReport> {
        info!("Starting statistics aggregation");

        let mut report = AggregationReport::default();
        for user_id in self.store.charged_user_ids().await? {
            let operations = self.store.charged_operations(user_id).await?;
            let stats = UserStatistics::from_operations(user_id, &operations);
            debug!(
                "User {}: {} operations, {} spent",
                user_id, stats.total_operations, stats.total_spent
            );

            self.store.upsert_statistics(&stats).await?;
            report.users += 1;
            report.operations += stats.total_operations;
        }

        info!(
            "Statistics aggregation completed: {} users, {} operations",
            report.users, report.operations
        );
        Ok(report)
    }

    /// Aggregate on every tick until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("Statistics aggregation failed: {}", e);
                    }
                }
            }
        }

        info!("Statistics aggregator stopped");
    }
}
