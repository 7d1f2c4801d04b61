// service/settlement_service.rs
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{BookingExt, Store, UserExt, WalletExt},
    models::{
        bookingmodel::*,
        escrowmodels::{DisputeResolution, EscrowDeposit, EscrowStatus},
        notificationmodel::NotificationCategory,
        usermodel::{Principal, UserRole},
        walletmodels::ensure_positive_amount,
    },
    service::{
        error::ServiceError, escrow_service::EscrowService,
        notification_service::NotificationDispatcher,
    },
};

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub service: String,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: String,
    pub location: Location,
    pub notes: Option<String>,
    /// A pre-selected worker; `None` lets the system pick one.
    pub worker_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmBudgetOutcome {
    Funded {
        booking: Booking,
        escrow: EscrowDeposit,
    },
    TopUpRequired {
        booking: Booking,
        shortfall: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingSettlement {
    pub booking: Booking,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow: Option<EscrowDeposit>,
}

/// Sequences booking transitions with the money movements they imply.
/// Forward steps escrow funds first and then write the booking conditionally
/// on the status they started from, so a retried step reuses the escrow
/// guards. Cancellation writes the booking first and refunds afterwards; a
/// forward step that loses its write to a cancellation hands its escrow back.
#[derive(Debug, Clone)]
pub struct SettlementService {
    store: Arc<dyn Store>,
    escrow: EscrowService,
    notifications: NotificationDispatcher,
}

impl SettlementService {
    pub fn new(
        store: Arc<dyn Store>,
        escrow: EscrowService,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            escrow,
            notifications,
        }
    }

    async fn load(&self, booking_id: Uuid) -> Result<Booking, ServiceError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Booking"))
    }

    async fn client_balance(&self, client_id: Uuid) -> Result<i64, ServiceError> {
        Ok(self
            .store
            .get_wallet(client_id)
            .await?
            .map(|wallet| wallet.balance)
            .unwrap_or(0))
    }

    async fn commit(
        &self,
        mut booking: Booking,
        event: BookingEvent,
        to: BookingStatus,
    ) -> Result<Booking, ServiceError> {
        let from = booking.status;
        booking.apply(event, to, Utc::now());
        let saved = self.store.update_booking(&booking, from).await?;
        tracing::info!(
            "booking {} moved {} -> {}",
            saved.id,
            from.to_str(),
            saved.status.to_str()
        );
        Ok(saved)
    }

    /// Commit for steps that escrowed funds before writing the booking.
    async fn commit_funded(
        &self,
        booking: Booking,
        event: BookingEvent,
        to: BookingStatus,
    ) -> Result<Booking, ServiceError> {
        let booking_id = booking.id;
        match self.commit(booking, event, to).await {
            Ok(saved) => Ok(saved),
            Err(err @ ServiceError::InvalidState(_)) => {
                self.return_orphaned_escrow(booking_id).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn return_orphaned_escrow(&self, booking_id: Uuid) {
        let current = match self.load(booking_id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::error!("could not re-read booking {} after a lost write: {}", booking_id, e);
                return;
            }
        };
        if current.status != BookingStatus::Cancelled {
            return;
        }
        match self.refund_held(booking_id).await {
            Ok(Some(escrow)) => tracing::info!(
                "escrow {} returned to client after booking {} was cancelled",
                escrow.id,
                booking_id
            ),
            Ok(None) => {}
            Err(e) => tracing::error!(
                "booking {} is cancelled but its escrow is still held: {}",
                booking_id,
                e
            ),
        }
    }

    /// Refunds the booking's escrow while it is still held. A refund that
    /// lost to another caller reads back the refunded escrow.
    async fn refund_held(&self, booking_id: Uuid) -> Result<Option<EscrowDeposit>, ServiceError> {
        match self.escrow.get_by_booking(booking_id).await? {
            Some(escrow) if escrow.escrow_status == EscrowStatus::Held && !escrow.refunded => {
                match self.escrow.refund(escrow.id).await {
                    Ok(settlement) => Ok(Some(settlement.escrow)),
                    Err(e) => {
                        let current = self.escrow.get(escrow.id).await?;
                        if current.refunded {
                            Ok(Some(current))
                        } else {
                            Err(e)
                        }
                    }
                }
            }
            other => Ok(other),
        }
    }

    pub async fn create_booking(
        &self,
        principal: &Principal,
        request: NewBooking,
    ) -> Result<Booking, ServiceError> {
        if principal.role != UserRole::Client {
            return Err(ServiceError::forbidden("Only clients can create bookings"));
        }
        if request.service.trim().is_empty() {
            return Err(ServiceError::validation("Service is required"));
        }

        let (worker, assignment_type) = match request.worker_id {
            Some(worker_id) => {
                let worker = self
                    .store
                    .get_user(worker_id)
                    .await?
                    .filter(|user| user.role == UserRole::Worker)
                    .ok_or_else(|| ServiceError::not_found("Worker"))?;
                (Some(worker), AssignmentType::ClientAssigned)
            }
            None => (
                self.store.find_available_worker(&request.service).await?,
                AssignmentType::SystemAssigned,
            ),
        };

        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4(),
            service: request.service,
            scheduled_date: request.scheduled_date,
            scheduled_time: request.scheduled_time,
            location_address: request.location.address,
            longitude: request.location.coordinates[0],
            latitude: request.location.coordinates[1],
            notes: request.notes,
            client_id: principal.id,
            worker_id: worker.as_ref().map(|w| w.id),
            assignment_type,
            status: BookingStatus::Pending,
            amount: None,
            review_id: None,
            dispute_raised_by: None,
            dispute_reason: None,
            dispute_details: None,
            dispute_raised_at: None,
            dispute_resolved_at: None,
            start_time: None,
            end_time: None,
            service_time: None,
            created_at: now,
            updated_at: now,
        };
        let booking = self.store.create_booking(&booking).await?;

        match &worker {
            Some(worker) => self.notifications.notify_booking(
                worker.id,
                booking.id,
                format!("New booking for {} has been assigned to you", booking.service),
            ),
            None => tracing::warn!(
                "no available worker for {}, booking {} left unassigned",
                booking.service,
                booking.id
            ),
        }
        Ok(booking)
    }

    /// The assigned worker agrees a budget. The booking starts straight away
    /// when the client can cover it, otherwise it waits for a top-up.
    pub async fn confirm_budget(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        amount: i64,
    ) -> Result<ConfirmBudgetOutcome, ServiceError> {
        if amount <= 0 {
            return Err(ServiceError::validation("Budget must be greater than zero"));
        }
        ensure_positive_amount(amount)?;
        let mut booking = self.load(booking_id).await?;
        let funded_to = booking.authorize(principal, BookingEvent::BudgetConfirmed { funded: true })?;
        booking.amount = Some(amount);

        let balance = self.client_balance(booking.client_id).await?;
        if balance >= amount {
            match self.escrow.open_or_reuse(&booking, amount).await {
                Ok(escrow) => {
                    let booking = self
                        .commit_funded(booking, BookingEvent::BudgetConfirmed { funded: true }, funded_to)
                        .await?;
                    self.notifications.notify_booking(
                        booking.client_id,
                        booking.id,
                        format!(
                            "Budget of {} confirmed and held in escrow. Your booking is in progress",
                            amount
                        ),
                    );
                    return Ok(ConfirmBudgetOutcome::Funded { booking, escrow });
                }
                Err(ServiceError::InsufficientFunds { .. }) => {
                    tracing::info!("balance changed while confirming booking {}", booking.id);
                }
                Err(e) => return Err(e),
            }
        }

        let balance = self.client_balance(booking.client_id).await?;
        let shortfall = (amount - balance).max(0);
        let to = booking.authorize(principal, BookingEvent::BudgetConfirmed { funded: false })?;
        let booking = self
            .commit(booking, BookingEvent::BudgetConfirmed { funded: false }, to)
            .await?;
        self.notifications.notify(
            booking.client_id,
            format!(
                "Budget of {} confirmed. Top up {} to start your booking",
                amount, shortfall
            ),
            NotificationCategory::Payment,
            Some(format!("/booking/{}", booking.id)),
        );
        Ok(ConfirmBudgetOutcome::TopUpRequired { booking, shortfall })
    }

    /// The client retries after topping up.
    pub async fn start(
        &self,
        principal: &Principal,
        booking_id: Uuid,
    ) -> Result<BookingSettlement, ServiceError> {
        let booking = self.load(booking_id).await?;
        let to = booking.authorize(principal, BookingEvent::Started)?;
        let amount = booking
            .amount
            .ok_or_else(|| ServiceError::invalid_state("Booking has no confirmed budget"))?;

        let escrow = self.escrow.open_or_reuse(&booking, amount).await?;
        let booking = self.commit_funded(booking, BookingEvent::Started, to).await?;

        if let Some(worker_id) = booking.worker_id {
            self.notifications
                .notify_booking(worker_id, booking.id, "The client has started the booking");
        }
        Ok(BookingSettlement {
            booking,
            escrow: Some(escrow),
        })
    }

    pub async fn mark_complete(
        &self,
        principal: &Principal,
        booking_id: Uuid,
    ) -> Result<BookingSettlement, ServiceError> {
        let booking = self.load(booking_id).await?;
        let to = booking.authorize(principal, BookingEvent::MarkedComplete)?;
        let worker_id = booking.require_worker()?;

        let escrow = match self.escrow.get_by_booking(booking.id).await? {
            Some(escrow) => escrow,
            None => {
                let amount = booking.amount.ok_or_else(|| {
                    ServiceError::invalid_state("Booking has no confirmed budget")
                })?;
                self.escrow.open_or_reuse(&booking, amount).await?
            }
        };

        let booking = self
            .commit_funded(booking, BookingEvent::MarkedComplete, to)
            .await?;
        if let Err(e) = self.store.add_completed_booking(worker_id, booking.id).await {
            tracing::warn!(
                "booking {} completed but not added to worker {}: {}",
                booking.id,
                worker_id,
                e
            );
        }

        self.notifications.notify_booking(
            booking.client_id,
            booking.id,
            "Your booking has been marked as complete. Please close it to release payment",
        );
        Ok(BookingSettlement {
            booking,
            escrow: Some(escrow),
        })
    }

    /// Releases the escrow to the worker and closes the booking.
    pub async fn close(
        &self,
        principal: &Principal,
        booking_id: Uuid,
    ) -> Result<BookingSettlement, ServiceError> {
        let booking = self.load(booking_id).await?;
        let to = booking.authorize(principal, BookingEvent::Closed)?;

        let escrow = self
            .escrow
            .get_by_booking(booking.id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Escrow"))?;
        let escrow = self.escrow.settle_to_worker(escrow.id).await?;
        let booking = self.commit(booking, BookingEvent::Closed, to).await?;

        self.notifications.notify(
            escrow.worker_id,
            format!("Payment of {} has been released to your wallet", escrow.net_amount()),
            NotificationCategory::Payment,
            Some(format!("/booking/{}", booking.id)),
        );
        Ok(BookingSettlement {
            booking,
            escrow: Some(escrow),
        })
    }

    /// Cancels an open booking and returns any held funds to the client. The
    /// booking is written before the refund, so a cancel retried after a
    /// failed refund finishes it.
    pub async fn cancel(
        &self,
        principal: &Principal,
        booking_id: Uuid,
    ) -> Result<BookingSettlement, ServiceError> {
        let booking = self.load(booking_id).await?;
        let unfinished_refund = booking.status == BookingStatus::Cancelled
            && booking.is_party(principal)
            && matches!(
                self.escrow.get_by_booking(booking.id).await?,
                Some(ref escrow) if escrow.escrow_status == EscrowStatus::Held && !escrow.refunded
            );

        let (booking, transitioned) = if unfinished_refund {
            tracing::info!("finishing refund for cancelled booking {}", booking.id);
            (booking, false)
        } else {
            let to = booking.authorize(principal, BookingEvent::Cancelled)?;
            (self.commit(booking, BookingEvent::Cancelled, to).await?, true)
        };
        let escrow = self.refund_held(booking.id).await?;

        if !transitioned {
            return Ok(BookingSettlement { booking, escrow });
        }
        let counterpart = if booking.client_id == principal.id {
            booking.worker_id
        } else {
            Some(booking.client_id)
        };
        if let Some(user_id) = counterpart {
            self.notifications
                .notify_booking(user_id, booking.id, "A booking has been cancelled");
        }
        Ok(BookingSettlement { booking, escrow })
    }

    pub async fn raise_dispute(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        reason: String,
        details: Option<String>,
    ) -> Result<BookingSettlement, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::validation("A dispute reason is required"));
        }
        let mut booking = self.load(booking_id).await?;
        let to = booking.authorize(principal, BookingEvent::Disputed)?;

        let escrow = match self.escrow.get_by_booking(booking.id).await? {
            Some(escrow) if escrow.escrow_status == EscrowStatus::Held => {
                Some(self.escrow.mark_disputed(escrow.id, reason.clone()).await?)
            }
            other => other,
        };

        booking.dispute_raised_by = Some(principal.id);
        booking.dispute_reason = Some(reason);
        booking.dispute_details = details;
        booking.dispute_raised_at = Some(Utc::now());
        let booking = self.commit(booking, BookingEvent::Disputed, to).await?;

        let counterpart = if booking.client_id == principal.id {
            booking.worker_id
        } else {
            Some(booking.client_id)
        };
        if let Some(user_id) = counterpart {
            self.notifications.notify(
                user_id,
                "A dispute has been raised on your booking",
                NotificationCategory::Dispute,
                Some(format!("/booking/{}", booking.id)),
            );
        }
        Ok(BookingSettlement { booking, escrow })
    }

    /// Admin decision on a disputed booking. A disputed escrow needs an
    /// explicit resolution saying where the money goes.
    pub async fn resolve_dispute(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        resolution: Option<DisputeResolution>,
    ) -> Result<BookingSettlement, ServiceError> {
        let booking = self.load(booking_id).await?;
        let to = booking.authorize(principal, BookingEvent::DisputeResolved)?;

        let escrow = match self.escrow.get_by_booking(booking.id).await? {
            Some(escrow) => {
                let settles = escrow.escrow_status == EscrowStatus::Disputed
                    || (escrow.escrow_status == EscrowStatus::Released && !escrow.funds_sent);
                match (settles, resolution) {
                    (true, Some(resolution)) => {
                        Some(self.escrow.resolve_dispute(escrow.id, resolution).await?)
                    }
                    (true, None) => {
                        return Err(ServiceError::validation(
                            "A resolution is required to settle the disputed escrow",
                        ))
                    }
                    (false, _) => Some(escrow),
                }
            }
            None => None,
        };
        let booking = self.commit(booking, BookingEvent::DisputeResolved, to).await?;

        for user_id in [Some(booking.client_id), booking.worker_id].into_iter().flatten() {
            self.notifications.notify(
                user_id,
                "The dispute on your booking has been resolved",
                NotificationCategory::Dispute,
                Some(format!("/booking/{}", booking.id)),
            );
        }
        Ok(BookingSettlement { booking, escrow })
    }

    pub async fn delete(&self, principal: &Principal, booking_id: Uuid) -> Result<(), ServiceError> {
        let booking = self.load(booking_id).await?;
        booking.ensure_deletable(principal)?;
        self.store.delete_booking(booking.id, BookingStatus::Closed).await?;
        tracing::info!("booking {} deleted by {}", booking.id, principal.id);
        Ok(())
    }

    pub async fn submit_review(
        &self,
        principal: &Principal,
        booking_id: Uuid,
        rating: i16,
        review: String,
        images: Vec<String>,
    ) -> Result<Review, ServiceError> {
        if !(1..=5).contains(&rating) {
            return Err(ServiceError::validation("Rating must be between 1 and 5"));
        }
        let booking = self.load(booking_id).await?;
        booking.ensure_reviewable(principal)?;
        let worker_id = booking.require_worker()?;

        let review = Review {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            client_id: principal.id,
            worker_id,
            rating,
            review,
            images,
            created_at: Utc::now(),
        };
        let review = self.store.create_review(&review).await?;

        self.notifications.notify(
            worker_id,
            format!("You received a {}-star review", rating),
            NotificationCategory::Review,
            Some(format!("/booking/{}", booking.id)),
        );
        Ok(review)
    }

    pub async fn get(&self, principal: &Principal, booking_id: Uuid) -> Result<Booking, ServiceError> {
        let booking = self.load(booking_id).await?;
        if !booking.is_party(principal) && !principal.is_admin() {
            return Err(ServiceError::forbidden("You are not part of this booking"));
        }
        Ok(booking)
    }

    pub async fn list(
        &self,
        principal: &Principal,
        filter: &BookingFilter,
    ) -> Result<(Vec<Booking>, i64), ServiceError> {
        if !principal.is_admin() {
            return Err(ServiceError::forbidden("Only admins can list all bookings"));
        }
        self.store.list_bookings(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use crate::db::{EscrowExt, TransactionExt};
    use crate::models::escrowmodels::PaymentStatus;
    use crate::models::usermodel::User;
    use crate::models::walletmodels::{Direction, NewTransaction, TransactionCategory, WalletSource};

    struct World {
        store: Arc<MemoryStore>,
        settlement: SettlementService,
        client: Principal,
        worker: Principal,
        admin: Principal,
    }

    fn user(role: UserRole, name: &str, services: &[&str]) -> User {
        User {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            role,
            services: services.iter().map(|s| s.to_string()).collect(),
            is_available: true,
            device_token: None,
            created_at: Utc::now(),
        }
    }

    async fn world(client_balance: i64) -> World {
        let store = Arc::new(MemoryStore::new());
        let client = user(UserRole::Client, "Wanjiru", &[]);
        let worker = user(UserRole::Worker, "Otieno", &["Deep Cleaning"]);
        let admin = user(UserRole::Admin, "Admin", &[]);
        for u in [&client, &worker, &admin] {
            store.insert_user(u.clone());
        }

        store.create_wallet(client.id).await.unwrap();
        if client_balance > 0 {
            store
                .credit_wallet(
                    client.id,
                    client_balance,
                    NewTransaction::new(TransactionCategory::AdminTopup, WalletSource::Revenue),
                )
                .await
                .unwrap();
        }

        let notifications = NotificationDispatcher::start(store.clone(), vec![]);
        let escrow = EscrowService::new(store.clone());
        World {
            settlement: SettlementService::new(store.clone(), escrow, notifications),
            client: Principal::from(&client),
            worker: Principal::from(&worker),
            admin: Principal::from(&admin),
            store,
        }
    }

    fn request(worker_id: Option<Uuid>) -> NewBooking {
        NewBooking {
            service: "Deep Cleaning".to_string(),
            scheduled_date: Utc::now().date_naive(),
            scheduled_time: "09:00".to_string(),
            location: Location {
                address: "Kilimani, Nairobi".to_string(),
                coordinates: [36.78, -1.29],
            },
            notes: Some("Two bedrooms".to_string()),
            worker_id,
        }
    }

    async fn balance(store: &MemoryStore, user_id: Uuid) -> i64 {
        store
            .get_wallet(user_id)
            .await
            .unwrap()
            .map(|w| w.balance)
            .unwrap_or(0)
    }

    async fn booking_in_progress(w: &World, amount: i64) -> Booking {
        let booking = w
            .settlement
            .create_booking(&w.client, request(Some(w.worker.id)))
            .await
            .unwrap();
        match w.settlement.confirm_budget(&w.worker, booking.id, amount).await.unwrap() {
            ConfirmBudgetOutcome::Funded { booking, .. } => booking,
            other => panic!("expected funded booking, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn funded_booking_runs_to_close() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 800).await;
        assert_eq!(booking.status, BookingStatus::InProgress);
        assert!(booking.start_time.is_some());
        assert_eq!(balance(&w.store, w.client.id).await, 200);

        let completed = w.settlement.mark_complete(&w.worker, booking.id).await.unwrap();
        assert_eq!(completed.booking.status, BookingStatus::Completed);
        assert_eq!(w.store.completed_bookings(w.worker.id), vec![booking.id]);

        let closed = w.settlement.close(&w.client, booking.id).await.unwrap();
        assert_eq!(closed.booking.status, BookingStatus::Closed);
        assert!(closed.booking.service_time.is_some());
        let escrow = closed.escrow.unwrap();
        assert!(escrow.funds_sent);
        assert_eq!(escrow.escrow_status, EscrowStatus::Released);

        assert_eq!(balance(&w.store, w.worker.id).await, 640);
        assert_eq!(balance(&w.store, w.client.id).await, 200);

        let logs = w.store.list_transactions_for_escrow(escrow.id).await.unwrap();
        let credits: Vec<_> = logs.iter().filter(|l| l.direction == Direction::Credit).collect();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].amount, 640);
    }

    #[tokio::test]
    async fn short_wallet_waits_for_top_up() {
        let w = world(300).await;
        let booking = w
            .settlement
            .create_booking(&w.client, request(Some(w.worker.id)))
            .await
            .unwrap();

        let outcome = w.settlement.confirm_budget(&w.worker, booking.id, 800).await.unwrap();
        let booking = match outcome {
            ConfirmBudgetOutcome::TopUpRequired { booking, shortfall } => {
                assert_eq!(shortfall, 500);
                booking
            }
            other => panic!("expected top-up, got {:?}", other),
        };
        assert_eq!(booking.status, BookingStatus::Confirmation);
        assert_eq!(booking.amount, Some(800));
        assert_eq!(balance(&w.store, w.client.id).await, 300);
        assert!(w.store.get_escrow_by_booking(booking.id).await.unwrap().is_none());

        let err = w.settlement.start(&w.client, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InsufficientFunds { .. }));

        w.store
            .credit_wallet(
                w.client.id,
                500,
                NewTransaction::new(TransactionCategory::Deposit, WalletSource::Deposit),
            )
            .await
            .unwrap();
        let started = w.settlement.start(&w.client, booking.id).await.unwrap();
        assert_eq!(started.booking.status, BookingStatus::InProgress);
        assert_eq!(balance(&w.store, w.client.id).await, 0);
    }

    #[tokio::test]
    async fn only_the_assigned_worker_confirms() {
        let w = world(1000).await;
        let booking = w
            .settlement
            .create_booking(&w.client, request(Some(w.worker.id)))
            .await
            .unwrap();

        let err = w
            .settlement
            .confirm_budget(&w.client, booking.id, 500)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        assert_eq!(balance(&w.store, w.client.id).await, 1000);
    }

    #[tokio::test]
    async fn workers_cannot_create_bookings() {
        let w = world(0).await;
        let err = w
            .settlement
            .create_booking(&w.worker, request(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn system_assignment_picks_a_matching_worker() {
        let w = world(0).await;
        let booking = w.settlement.create_booking(&w.client, request(None)).await.unwrap();
        assert_eq!(booking.assignment_type, AssignmentType::SystemAssigned);
        assert_eq!(booking.worker_id, Some(w.worker.id));

        let mut other = request(None);
        other.service = "Gardening".to_string();
        let unassigned = w.settlement.create_booking(&w.client, other).await.unwrap();
        assert_eq!(unassigned.worker_id, None);
        let err = w
            .settlement
            .confirm_budget(&w.worker, unassigned.id, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn concurrent_closes_settle_once() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 1000).await;
        w.settlement.mark_complete(&w.worker, booking.id).await.unwrap();

        let first = {
            let settlement = w.settlement.clone();
            let client = w.client;
            tokio::spawn(async move { settlement.close(&client, booking.id).await })
        };
        let second = {
            let settlement = w.settlement.clone();
            let client = w.client;
            tokio::spawn(async move { settlement.close(&client, booking.id).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, ServiceError::InvalidState(_)), "got {e}");
            }
        }
        assert_eq!(balance(&w.store, w.worker.id).await, 800);
    }

    #[tokio::test]
    async fn retried_close_after_lost_booking_write_proceeds() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 500).await;
        w.settlement.mark_complete(&w.worker, booking.id).await.unwrap();

        let escrow = w.store.get_escrow_by_booking(booking.id).await.unwrap().unwrap();
        w.store
            .set_escrow_status(escrow.id, EscrowStatus::Held, EscrowStatus::Released, None)
            .await
            .unwrap();
        w.store.release_escrow(escrow.id).await.unwrap();

        let closed = w.settlement.close(&w.client, booking.id).await.unwrap();
        assert_eq!(closed.booking.status, BookingStatus::Closed);
        assert_eq!(balance(&w.store, w.worker.id).await, 400);
    }

    #[tokio::test]
    async fn cancelling_refunds_held_escrow() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 600).await;
        assert_eq!(balance(&w.store, w.client.id).await, 400);

        let cancelled = w.settlement.cancel(&w.worker, booking.id).await.unwrap();
        assert_eq!(cancelled.booking.status, BookingStatus::Cancelled);
        assert!(cancelled.booking.end_time.is_some());
        let escrow = cancelled.escrow.unwrap();
        assert!(escrow.refunded);
        assert_eq!(escrow.escrow_status, EscrowStatus::Refunded);
        assert_eq!(balance(&w.store, w.client.id).await, 1000);

        let err = w.settlement.cancel(&w.client, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_racing_completion_never_strands_funds() {
        for _ in 0..50 {
            let w = world(1000).await;
            let booking = booking_in_progress(&w, 800).await;

            let cancel = {
                let settlement = w.settlement.clone();
                let client = w.client;
                tokio::spawn(async move { settlement.cancel(&client, booking.id).await })
            };
            let complete = {
                let settlement = w.settlement.clone();
                let worker = w.worker;
                tokio::spawn(async move { settlement.mark_complete(&worker, booking.id).await })
            };
            let (cancel, complete) = (cancel.await.unwrap(), complete.await.unwrap());
            assert_ne!(cancel.is_ok(), complete.is_ok());

            let current = w.store.get_booking(booking.id).await.unwrap().unwrap();
            let escrow = w.store.get_escrow_by_booking(booking.id).await.unwrap().unwrap();
            match current.status {
                BookingStatus::Cancelled => {
                    assert_eq!(escrow.escrow_status, EscrowStatus::Refunded);
                    assert_eq!(balance(&w.store, w.client.id).await, 1000);
                }
                BookingStatus::Completed => {
                    assert_eq!(escrow.escrow_status, EscrowStatus::Held);
                    assert_eq!(balance(&w.store, w.client.id).await, 200);
                    w.settlement.close(&w.client, booking.id).await.unwrap();
                    assert_eq!(balance(&w.store, w.worker.id).await, 640);
                }
                other => panic!("unexpected status {:?}", other),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancel_racing_budget_confirmation_returns_funds() {
        for _ in 0..50 {
            let w = world(1000).await;
            let booking = w
                .settlement
                .create_booking(&w.client, request(Some(w.worker.id)))
                .await
                .unwrap();

            let confirm = {
                let settlement = w.settlement.clone();
                let worker = w.worker;
                tokio::spawn(async move { settlement.confirm_budget(&worker, booking.id, 800).await })
            };
            let cancel = {
                let settlement = w.settlement.clone();
                let client = w.client;
                tokio::spawn(async move { settlement.cancel(&client, booking.id).await })
            };
            let (confirm, cancel) = (confirm.await.unwrap(), cancel.await.unwrap());

            let current = w.store.get_booking(booking.id).await.unwrap().unwrap();
            let escrow = w.store.get_escrow_by_booking(booking.id).await.unwrap();
            match current.status {
                BookingStatus::Cancelled => {
                    assert!(cancel.is_ok());
                    assert!(escrow.map_or(true, |e| e.escrow_status == EscrowStatus::Refunded));
                    assert_eq!(balance(&w.store, w.client.id).await, 1000);
                }
                BookingStatus::InProgress => {
                    assert!(confirm.is_ok() && cancel.is_err());
                    assert_eq!(escrow.unwrap().escrow_status, EscrowStatus::Held);
                    assert_eq!(balance(&w.store, w.client.id).await, 200);
                }
                other => panic!("unexpected status {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn retried_cancel_finishes_an_interrupted_refund() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 800).await;

        let mut cancelled = w.store.get_booking(booking.id).await.unwrap().unwrap();
        cancelled.status = BookingStatus::Cancelled;
        w.store
            .update_booking(&cancelled, BookingStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(balance(&w.store, w.client.id).await, 200);

        let stranger = Principal::new(Uuid::new_v4(), UserRole::Client);
        let err = w.settlement.cancel(&stranger, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let finished = w.settlement.cancel(&w.client, booking.id).await.unwrap();
        assert_eq!(finished.booking.status, BookingStatus::Cancelled);
        assert_eq!(finished.escrow.unwrap().escrow_status, EscrowStatus::Refunded);
        assert_eq!(balance(&w.store, w.client.id).await, 1000);

        let err = w.settlement.cancel(&w.client, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn strangers_cannot_cancel() {
        let w = world(0).await;
        let booking = w
            .settlement
            .create_booking(&w.client, request(Some(w.worker.id)))
            .await
            .unwrap();
        let stranger = Principal::new(Uuid::new_v4(), UserRole::Worker);
        let err = w.settlement.cancel(&stranger, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn dispute_then_refund_resolution() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 1000).await;
        w.settlement.mark_complete(&w.worker, booking.id).await.unwrap();

        let disputed = w
            .settlement
            .raise_dispute(&w.client, booking.id, "Job not done".to_string(), None)
            .await
            .unwrap();
        assert_eq!(disputed.booking.status, BookingStatus::Disputed);
        assert_eq!(disputed.escrow.unwrap().escrow_status, EscrowStatus::Disputed);
        let details = disputed.booking.dispute().unwrap();
        assert_eq!(details.raised_by, w.client.id);
        assert!(!details.resolved);

        let err = w.settlement.close(&w.client, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let err = w
            .settlement
            .resolve_dispute(&w.client, booking.id, Some(DisputeResolution::RefundToClient))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = w
            .settlement
            .resolve_dispute(&w.admin, booking.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let resolved = w
            .settlement
            .resolve_dispute(&w.admin, booking.id, Some(DisputeResolution::RefundToClient))
            .await
            .unwrap();
        assert_eq!(resolved.booking.status, BookingStatus::Resolved);
        assert!(resolved.booking.dispute().unwrap().resolved);
        assert_eq!(balance(&w.store, w.client.id).await, 1000);
        assert_eq!(balance(&w.store, w.worker.id).await, 0);
    }

    #[tokio::test]
    async fn reviews_and_deletion_need_a_closed_booking() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 500).await;

        let err = w
            .settlement
            .submit_review(&w.client, booking.id, 5, "Great".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        w.settlement.mark_complete(&w.worker, booking.id).await.unwrap();
        w.settlement.close(&w.client, booking.id).await.unwrap();

        let err = w
            .settlement
            .submit_review(&w.client, booking.id, 6, "Too good".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let review = w
            .settlement
            .submit_review(&w.client, booking.id, 5, "Spotless".to_string(), vec![])
            .await
            .unwrap();
        assert_eq!(review.worker_id, w.worker.id);

        let err = w
            .settlement
            .submit_review(&w.client, booking.id, 4, "Again".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyProcessed(_)));

        let err = w.settlement.delete(&w.worker, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        w.settlement.delete(&w.client, booking.id).await.unwrap();
        let err = w.settlement.get(&w.client, booking.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn listing_is_admin_only() {
        let w = world(0).await;
        w.settlement
            .create_booking(&w.client, request(Some(w.worker.id)))
            .await
            .unwrap();
        let filter = BookingFilter {
            limit: 10,
            ..Default::default()
        };

        let err = w.settlement.list(&w.client, &filter).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
        let (bookings, total) = w.settlement.list(&w.admin, &filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(bookings.len(), 1);
    }

    #[tokio::test]
    async fn escrow_payment_status_stays_success_through_settlement() {
        let w = world(1000).await;
        let booking = booking_in_progress(&w, 1000).await;
        let escrow = w.store.get_escrow_by_booking(booking.id).await.unwrap().unwrap();
        assert_eq!(escrow.status, PaymentStatus::Success);
        assert_eq!(escrow.revenue, 200);
        assert_eq!(escrow.status_history.0.len(), 1);
    }
}
