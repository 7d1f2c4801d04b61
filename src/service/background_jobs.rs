// service/background_jobs.rs
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};

use crate::AppState;

/// Moves PENDING escrows past their payment window to EXPIRED.
pub async fn start_escrow_expiry_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(3600));

    loop {
        interval.tick().await;

        tracing::info!("Running escrow expiry job at {}", Utc::now());

        match app_state.escrow_service.expire_stale().await {
            Ok(0) => tracing::debug!("Escrow expiry job found nothing to expire"),
            Ok(expired) => tracing::info!("Escrow expiry job expired {} escrows", expired),
            Err(e) => tracing::error!("Escrow expiry job failed: {}", e),
        }
    }
}

/// Polls the payout gateway for withdrawals that are still pending.
pub async fn start_payout_status_job(app_state: Arc<AppState>) {
    let mut interval = interval(Duration::from_secs(60));

    loop {
        interval.tick().await;

        match app_state.payment_service.poll_payouts().await {
            Ok(sweep) if sweep.settled + sweep.reversed + sweep.unreferenced > 0 => tracing::info!(
                "Payout status job: {} settled, {} reversed, {} still pending, {} without a batch",
                sweep.settled,
                sweep.reversed,
                sweep.pending,
                sweep.unreferenced
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Payout status job failed: {}", e),
        }
    }
}
