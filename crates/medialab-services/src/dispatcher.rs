//! Job dispatcher: reserve, then enqueue

use crate::billing::{BillingService, ReserveRequest};
use medialab_core::{
    models::{JobDescriptor, Reservation},
    traits::{JobQueue, LedgerStore},
    AppResult,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Accepted submission
#[derive(Debug, Clone)]
pub struct Submission {
    pub reservation: Reservation,
    pub job_id: Uuid,
}

/// Entry point for new work. Nothing is queued without a reservation, and a
/// reservation whose job never reached the queue is refunded.
pub struct JobDispatcher<S: LedgerStore> {
    billing: Arc<BillingService<S>>,
    queue: Arc<dyn JobQueue>,
}

impl<S: LedgerStore> JobDispatcher<S> {
    pub fn new(billing: Arc<BillingService<S>>, queue: Arc<dyn JobQueue>) -> Self {
        Self { billing, queue }
    }

    #[instrument(skip(self, request, params), fields(user_id = request.user_id, kind = %request.kind))]
    pub async fn submit(
        &self,
        request: &ReserveRequest,
        params: serde_json::Value,
    ) -> AppResult<Submission> {
        let reservation = self.billing.reserve_request(request).await?;
        let job = JobDescriptor::new(&reservation.operation, params);

        if let Err(e) = self.queue.enqueue(&job).await {
            warn!(
                "Enqueue failed for operation {}, refunding: {}",
                reservation.operation_id(),
                e
            );
            if let Err(refund_err) = self.billing.refund(reservation.operation_id()).await {
                // the sweeper fails it once the TTL passes
                error!(
                    "Refund after enqueue failure failed for {}: {}",
                    reservation.operation_id(),
                    refund_err
                );
            }
            return Err(e);
        }

        info!(
            job_id = %job.job_id,
            operation_id = %reservation.operation_id(),
            "Submitted job"
        );

        Ok(Submission {
            job_id: job.job_id,
            reservation,
        })
    }
}
