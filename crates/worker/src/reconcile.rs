//! Scheduled reconciliation jobs
//!
//! Webhook syncs that fail are never retried by the API. The full re-sync
//! here is what eventually repairs them.

use std::time::Instant;

use priceye_billing::{
    InvariantCheckSummary, InvariantChecker, ReconcileSummary, SubscriptionSynchronizer,
    ViolationSeverity,
};
use tracing::{error, info, warn};

/// Re-sync every mapped customer from Stripe
pub async fn run_reconciliation(synchronizer: &SubscriptionSynchronizer) -> Option<ReconcileSummary> {
    info!("Running scheduled subscription reconciliation");
    let started = Instant::now();

    match synchronizer.sync_all().await {
        Ok(summary) => {
            log_reconcile_summary(&summary, started.elapsed().as_millis());
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Reconciliation could not list customers");
            None
        }
    }
}

fn log_reconcile_summary(summary: &ReconcileSummary, elapsed_ms: u128) {
    info!(
        customers = summary.customers,
        synced = summary.synced,
        stale = summary.stale,
        failed = summary.failed.len(),
        elapsed_ms = elapsed_ms as u64,
        "Reconciliation cycle complete"
    );

    for failure in &summary.failed {
        error!(
            customer_id = %failure.customer_id,
            error = %failure.error,
            "Customer failed to reconcile"
        );
    }
}

/// Run the SQL consistency checks and log every violation
pub async fn run_invariant_checks(checker: &InvariantChecker) -> Option<InvariantCheckSummary> {
    info!("Running billing invariant checks");

    match checker.run_all_checks().await {
        Ok(summary) => {
            log_invariant_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant checks failed to run");
            None
        }
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "All billing invariants hold");
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant violations found"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                context = %violation.context,
                "{}",
                violation.description
            ),
            _ => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                user_ids = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }
}
