//! Background settlement jobs with bounded retry.
//!
//! Jobs are re-entrant: `settle` re-checks everything under the lock, so a job
//! delivered twice or retried after a timeout cannot settle twice.

use std::sync::Arc;

use backon::Retryable;

use crate::config::RetryPolicy;
use crate::settlement::{SettlementError, SettlementOutcome, SettlementService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementJob {
    pub order_id: i64,
    pub intent_id: String,
}

/// Where settlement work is handed off from request handlers.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: SettlementJob);
}

/// Runs each job on its own tokio task.
pub struct TokioJobQueue {
    settlement: Arc<SettlementService>,
    policy: RetryPolicy,
}

impl TokioJobQueue {
    pub fn new(settlement: Arc<SettlementService>, policy: RetryPolicy) -> Self {
        Self { settlement, policy }
    }
}

impl JobQueue for TokioJobQueue {
    fn enqueue(&self, job: SettlementJob) {
        let settlement = self.settlement.clone();
        let policy = self.policy;
        tracing::debug!(order_id = job.order_id, intent_id = %job.intent_id, "Settlement job queued");
        tokio::spawn(async move {
            // Failures are logged inside; nothing to propagate from a detached task.
            let _ = run_settlement_job(&settlement, &job, policy).await;
        });
    }
}

/// Run one settlement job, retrying retryable failures with exponential backoff.
/// Exhausted or permanent failures are logged at error level for manual follow-up.
pub async fn run_settlement_job(
    settlement: &SettlementService,
    job: &SettlementJob,
    policy: RetryPolicy,
) -> Result<SettlementOutcome, SettlementError> {
    let result = (|| settlement.settle(job.order_id, &job.intent_id))
        .retry(policy.backoff())
        .when(|e: &SettlementError| e.is_retryable())
        .notify(|e: &SettlementError, delay| {
            tracing::warn!(
                order_id = job.order_id,
                intent_id = %job.intent_id,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Settlement attempt failed, retrying"
            );
        })
        .await;

    if let Err(e) = &result {
        tracing::error!(
            order_id = job.order_id,
            intent_id = %job.intent_id,
            error = %e,
            retryable = e.is_retryable(),
            "Settlement job failed permanently, manual intervention required"
        );
    }
    result
}
