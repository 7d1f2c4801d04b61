// service/escrow_service.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    db::{EscrowExt, Store, UserExt},
    models::{bookingmodel::Booking, escrowmodels::*},
    service::error::ServiceError,
};

#[derive(Debug, Clone)]
pub struct EscrowService {
    store: Arc<dyn Store>,
}

impl EscrowService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Debits the client and holds the gross amount against `booking`.
    pub async fn open(&self, booking: &Booking, amount: i64) -> Result<EscrowDeposit, ServiceError> {
        let worker_id = booking.require_worker()?;
        let labels = self.labels(booking, worker_id).await;

        self.store
            .open_escrow(booking.client_id, worker_id, booking.id, amount, labels)
            .await
    }

    /// Like `open`, but a retry after a partial failure reuses the escrow
    /// that already exists for the booking.
    pub async fn open_or_reuse(
        &self,
        booking: &Booking,
        amount: i64,
    ) -> Result<EscrowDeposit, ServiceError> {
        match self.open(booking, amount).await {
            Err(ServiceError::AlreadyProcessed(_)) => {
                tracing::info!("reusing existing escrow for booking {}", booking.id);
                self.store
                    .get_escrow_by_booking(booking.id)
                    .await?
                    .ok_or_else(|| ServiceError::not_found("Escrow"))
            }
            other => other,
        }
    }

    async fn labels(&self, booking: &Booking, worker_id: Uuid) -> RevenueLabels {
        let client = self.store.get_user(booking.client_id).await.ok().flatten();
        let worker = self.store.get_user(worker_id).await.ok().flatten();
        RevenueLabels {
            client_name: client.map(|u| u.name),
            worker_name: worker.map(|u| u.name),
            booking_name: Some(booking.service.clone()).filter(|s| !s.trim().is_empty()),
        }
    }

    /// Reads with lazy expiry of a stale pending escrow.
    pub async fn get(&self, escrow_id: Uuid) -> Result<EscrowDeposit, ServiceError> {
        let escrow = self
            .store
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Escrow"))?;
        self.expire_on_read(escrow).await
    }

    pub async fn get_by_booking(&self, booking_id: Uuid) -> Result<Option<EscrowDeposit>, ServiceError> {
        match self.store.get_escrow_by_booking(booking_id).await? {
            Some(escrow) => Ok(Some(self.expire_on_read(escrow).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<EscrowDeposit, ServiceError> {
        let escrow = self
            .store
            .get_escrow_by_transaction_id(transaction_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Escrow"))?;
        self.expire_on_read(escrow).await
    }

    async fn expire_on_read(&self, escrow: EscrowDeposit) -> Result<EscrowDeposit, ServiceError> {
        let now = Utc::now();
        if escrow.is_stale(now) {
            return self.store.expire_escrow(escrow.id, now).await;
        }
        Ok(escrow)
    }

    /// Credits the worker with the net amount of a RELEASED escrow.
    pub async fn release(&self, escrow_id: Uuid) -> Result<EscrowSettlement, ServiceError> {
        self.store.release_escrow(escrow_id).await
    }

    /// Returns the gross amount of a HELD escrow to the client.
    pub async fn refund(&self, escrow_id: Uuid) -> Result<EscrowSettlement, ServiceError> {
        self.store.refund_escrow(escrow_id, EscrowStatus::Held).await
    }

    pub async fn mark_released(&self, escrow_id: Uuid) -> Result<EscrowDeposit, ServiceError> {
        self.store
            .set_escrow_status(
                escrow_id,
                EscrowStatus::Held,
                EscrowStatus::Released,
                Some("Approved for release".to_string()),
            )
            .await
    }

    pub async fn mark_disputed(
        &self,
        escrow_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<EscrowDeposit, ServiceError> {
        self.store
            .set_escrow_status(
                escrow_id,
                EscrowStatus::Held,
                EscrowStatus::Disputed,
                Some(reason.into()),
            )
            .await
    }

    /// Flips a HELD escrow to RELEASED if needed and pays the worker. A retry
    /// that finds the funds already sent returns the escrow unchanged.
    pub async fn settle_to_worker(&self, escrow_id: Uuid) -> Result<EscrowDeposit, ServiceError> {
        let escrow = self.get(escrow_id).await?;
        match escrow.escrow_status {
            EscrowStatus::Held => {
                self.mark_released(escrow_id).await?;
            }
            EscrowStatus::Released => {}
            other => {
                return Err(ServiceError::invalid_state(format!(
                    "Escrow is {:?} and cannot be released",
                    other
                )))
            }
        }

        match self.release(escrow_id).await {
            Ok(settlement) => Ok(settlement.escrow),
            Err(ServiceError::AlreadyProcessed(_)) => {
                tracing::info!("escrow {} already paid out, continuing", escrow_id);
                self.get(escrow_id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Settles a DISPUTED escrow one way or the other. Safe to retry.
    pub async fn resolve_dispute(
        &self,
        escrow_id: Uuid,
        resolution: DisputeResolution,
    ) -> Result<EscrowDeposit, ServiceError> {
        let escrow = self.get(escrow_id).await?;
        match resolution {
            DisputeResolution::ReleaseToWorker => {
                if escrow.escrow_status == EscrowStatus::Disputed {
                    self.store
                        .set_escrow_status(
                            escrow_id,
                            EscrowStatus::Disputed,
                            EscrowStatus::Released,
                            Some("Dispute resolved in favour of worker".to_string()),
                        )
                        .await?;
                }
                match self.release(escrow_id).await {
                    Ok(settlement) => Ok(settlement.escrow),
                    Err(ServiceError::AlreadyProcessed(_)) => self.get(escrow_id).await,
                    Err(e) => Err(e),
                }
            }
            DisputeResolution::RefundToClient => {
                match self.store.refund_escrow(escrow_id, EscrowStatus::Disputed).await {
                    Ok(settlement) => Ok(settlement.escrow),
                    Err(ServiceError::AlreadyProcessed(_)) => self.get(escrow_id).await,
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub async fn expire_stale(&self) -> Result<u64, ServiceError> {
        self.store.expire_stale_escrows(Utc::now()).await
    }

    pub async fn revenue_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RevenueRecord>, ServiceError> {
        if from > to {
            return Err(ServiceError::validation("Range start must be before its end"));
        }
        self.store.list_revenue(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::WalletExt;
    use crate::models::bookingmodel::{tests::booking_for, BookingStatus};
    use crate::models::usermodel::{User, UserRole};
    use crate::models::walletmodels::{NewTransaction, TransactionCategory, WalletSource};
    use chrono::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        escrows: EscrowService,
        booking: Booking,
    }

    async fn fixture(balance: i64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let client = Uuid::new_v4();
        let worker = Uuid::new_v4();
        store.insert_user(User {
            id: client,
            name: "Amina".to_string(),
            email: "amina@example.com".to_string(),
            role: UserRole::Client,
            services: vec![],
            is_available: false,
            device_token: None,
            created_at: Utc::now(),
        });
        store.create_wallet(client).await.unwrap();
        store
            .credit_wallet(
                client,
                balance,
                NewTransaction::new(TransactionCategory::AdminTopup, WalletSource::Revenue),
            )
            .await
            .unwrap();

        let booking = booking_for(client, Some(worker), BookingStatus::Pending);
        Fixture {
            escrows: EscrowService::new(store.clone()),
            store,
            booking,
        }
    }

    #[tokio::test]
    async fn open_copies_display_names() {
        let f = fixture(1000).await;
        f.escrows.open(&f.booking, 1000).await.unwrap();

        let revenue = f
            .store
            .list_revenue(Utc::now() - Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(revenue[0].client_name, "Amina");
        assert_eq!(revenue[0].worker_name, "Worker");
        assert_eq!(revenue[0].booking_name, "Deep Cleaning");
        assert_eq!(revenue[0].revenue, 200);
    }

    #[tokio::test]
    async fn reopening_reuses_the_escrow() {
        let f = fixture(1000).await;
        let first = f.escrows.open_or_reuse(&f.booking, 600).await.unwrap();
        let second = f.escrows.open_or_reuse(&f.booking, 600).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(
            f.store.get_wallet(f.booking.client_id).await.unwrap().unwrap().balance,
            400
        );
    }

    #[tokio::test]
    async fn settle_to_worker_is_safe_to_retry() {
        let f = fixture(1000).await;
        let escrow = f.escrows.open(&f.booking, 1000).await.unwrap();

        let settled = f.escrows.settle_to_worker(escrow.id).await.unwrap();
        assert!(settled.funds_sent);
        let again = f.escrows.settle_to_worker(escrow.id).await.unwrap();
        assert!(again.funds_sent);

        let worker = f.booking.worker_id.unwrap();
        assert_eq!(f.store.get_wallet(worker).await.unwrap().unwrap().balance, 800);
    }

    #[tokio::test]
    async fn dispute_resolution_refunds_client() {
        let f = fixture(500).await;
        let escrow = f.escrows.open(&f.booking, 500).await.unwrap();
        let disputed = f.escrows.mark_disputed(escrow.id, "No show").await.unwrap();
        assert_eq!(disputed.escrow_status, EscrowStatus::Disputed);
        assert_eq!(disputed.dispute_reason.as_deref(), Some("No show"));

        let err = f.escrows.refund(escrow.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let resolved = f
            .escrows
            .resolve_dispute(escrow.id, DisputeResolution::RefundToClient)
            .await
            .unwrap();
        assert!(resolved.refunded);
        assert!(resolved.dispute_resolved_at.is_some());
        assert_eq!(
            f.store.get_wallet(f.booking.client_id).await.unwrap().unwrap().balance,
            500
        );
    }

    #[tokio::test]
    async fn dispute_resolution_pays_worker() {
        let f = fixture(500).await;
        let escrow = f.escrows.open(&f.booking, 500).await.unwrap();
        f.escrows.mark_disputed(escrow.id, "Late").await.unwrap();

        let resolved = f
            .escrows
            .resolve_dispute(escrow.id, DisputeResolution::ReleaseToWorker)
            .await
            .unwrap();
        assert!(resolved.funds_sent);
        assert_eq!(resolved.escrow_status, EscrowStatus::Released);
        let worker = f.booking.worker_id.unwrap();
        assert_eq!(f.store.get_wallet(worker).await.unwrap().unwrap().balance, 400);
    }

    #[tokio::test]
    async fn reads_expire_stale_pending_escrows() {
        let f = fixture(1).await;
        let mut escrow = EscrowDeposit::funded(
            f.booking.client_id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            300,
        );
        escrow.status = PaymentStatus::Pending;
        escrow.expires_at = Utc::now() - Duration::minutes(1);
        let id = escrow.id;
        f.store.insert_escrow(escrow);

        let read = f.escrows.get(id).await.unwrap();
        assert_eq!(read.status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn revenue_range_must_be_ordered() {
        let f = fixture(1000).await;
        f.escrows.open(&f.booking, 1000).await.unwrap();

        let now = Utc::now();
        let err = f
            .escrows
            .revenue_between(now, now - Duration::hours(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let records = f
            .escrows
            .revenue_between(now - Duration::hours(1), now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
