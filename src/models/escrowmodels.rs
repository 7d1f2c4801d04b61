// models/escrowmodels.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::walletmodels::LedgerReceipt;
use crate::service::error::ServiceError;

/// Platform cut in basis points.
pub const REVENUE_RATE_BPS: i64 = 2000;
pub const ESCROW_TTL_HOURS: i64 = 24;

/// 20% of the gross amount, rounded half-up to a whole unit.
pub fn platform_revenue(gross: i64) -> i64 {
    ((gross as i128 * REVENUE_RATE_BPS as i128 + 5000) / 10000) as i64
}

pub fn worker_net(gross: i64) -> i64 {
    gross - platform_revenue(gross)
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Expired,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "escrow_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
    Disputed,
}

impl EscrowStatus {
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        matches!(
            (self, to),
            (EscrowStatus::Held, EscrowStatus::Released)
                | (EscrowStatus::Held, EscrowStatus::Refunded)
                | (EscrowStatus::Held, EscrowStatus::Disputed)
                | (EscrowStatus::Disputed, EscrowStatus::Released)
                | (EscrowStatus::Disputed, EscrowStatus::Refunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Released | EscrowStatus::Refunded)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusChange {
    pub status: PaymentStatus,
    pub escrow_status: EscrowStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    ReleaseToWorker,
    RefundToClient,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EscrowDeposit {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub amount: i64,
    pub revenue: i64,
    pub client_id: Uuid,
    pub worker_id: Uuid,
    pub booking_id: Uuid,
    pub status: PaymentStatus,
    pub escrow_status: EscrowStatus,
    pub funds_sent: bool,
    pub refunded: bool,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub dispute_reason: Option<String>,
    pub disputed_at: Option<DateTime<Utc>>,
    pub dispute_resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
    pub status_history: Json<Vec<StatusChange>>,
}

impl EscrowDeposit {
    /// A freshly funded escrow: the client has already been debited.
    pub fn funded(client_id: Uuid, worker_id: Uuid, booking_id: Uuid, amount: i64) -> Self {
        let now = Utc::now();
        let mut escrow = EscrowDeposit {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            amount,
            revenue: platform_revenue(amount),
            client_id,
            worker_id,
            booking_id,
            status: PaymentStatus::Success,
            escrow_status: EscrowStatus::Held,
            funds_sent: false,
            refunded: false,
            released_at: None,
            refunded_at: None,
            dispute_reason: None,
            disputed_at: None,
            dispute_resolved_at: None,
            created_at: now,
            expires_at: now + Duration::hours(ESCROW_TTL_HOURS),
            last_status_change: now,
            status_history: Json(Vec::new()),
        };
        escrow.record_change(Some("Funds held in escrow".to_string()));
        escrow
    }

    pub fn net_amount(&self) -> i64 {
        self.amount - self.revenue
    }

    pub fn record_change(&mut self, reason: Option<String>) {
        let now = Utc::now();
        self.last_status_change = now;
        self.status_history.0.push(StatusChange {
            status: self.status,
            escrow_status: self.escrow_status,
            timestamp: now,
            reason,
        });
    }

    /// Moves the escrow status, rejecting anything outside the allowed table.
    pub fn transition(
        &mut self,
        from: EscrowStatus,
        to: EscrowStatus,
        reason: Option<String>,
    ) -> Result<(), ServiceError> {
        if self.escrow_status != from {
            return Err(ServiceError::invalid_state(format!(
                "Escrow is {:?}, expected {:?}",
                self.escrow_status, from
            )));
        }
        if !from.can_transition_to(to) {
            return Err(ServiceError::invalid_state(format!(
                "Cannot move escrow from {:?} to {:?}",
                from, to
            )));
        }
        if self.status != PaymentStatus::Success {
            return Err(ServiceError::invalid_state(format!(
                "Escrow payment is {:?}",
                self.status
            )));
        }
        self.escrow_status = to;
        match to {
            EscrowStatus::Disputed => {
                self.disputed_at = Some(Utc::now());
                self.dispute_reason = reason.clone();
            }
            _ if from == EscrowStatus::Disputed => {
                self.dispute_resolved_at = Some(Utc::now());
            }
            _ => {}
        }
        self.record_change(reason);
        Ok(())
    }

    pub fn ensure_releasable(&self) -> Result<(), ServiceError> {
        if self.status != PaymentStatus::Success || self.escrow_status != EscrowStatus::Released {
            return Err(ServiceError::invalid_state(
                "Escrow must be successful and released before funds are sent",
            ));
        }
        if self.funds_sent {
            return Err(ServiceError::already_processed("Funds already sent to worker"));
        }
        Ok(())
    }

    /// `expected` is HELD for a plain refund and DISPUTED when a dispute is
    /// settled in the client's favour.
    pub fn ensure_refundable(&self, expected: EscrowStatus) -> Result<(), ServiceError> {
        if self.refunded {
            return Err(ServiceError::already_processed("Escrow already refunded"));
        }
        if self.status != PaymentStatus::Success || self.escrow_status != expected {
            return Err(ServiceError::invalid_state(format!(
                "Escrow cannot be refunded while {:?}/{:?}",
                self.status, self.escrow_status
            )));
        }
        Ok(())
    }

    pub fn mark_funds_sent(&mut self) {
        self.funds_sent = true;
        self.released_at = Some(Utc::now());
        self.record_change(Some("Funds released to worker".to_string()));
    }

    pub fn mark_refunded(&mut self) {
        if self.escrow_status == EscrowStatus::Disputed {
            self.dispute_resolved_at = Some(Utc::now());
        }
        self.refunded = true;
        self.escrow_status = EscrowStatus::Refunded;
        self.refunded_at = Some(Utc::now());
        self.record_change(Some("Funds refunded to client".to_string()));
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && now > self.expires_at
    }

    /// Returns true when the record changed.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_stale(now) {
            return false;
        }
        self.status = PaymentStatus::Expired;
        self.record_change(Some("Payment window expired".to_string()));
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RevenueRecord {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: i64,
    pub revenue: i64,
    pub client_name: String,
    pub worker_name: String,
    pub booking_name: String,
    pub created_at: DateTime<Utc>,
}

impl RevenueRecord {
    pub fn for_escrow(escrow: &EscrowDeposit, labels: RevenueLabels) -> Self {
        RevenueRecord {
            id: Uuid::new_v4(),
            escrow_id: escrow.id,
            transaction_id: escrow.transaction_id,
            amount: escrow.amount,
            revenue: escrow.revenue,
            client_name: labels.client_name.unwrap_or_else(|| "Client".to_string()),
            worker_name: labels.worker_name.unwrap_or_else(|| "Worker".to_string()),
            booking_name: labels
                .booking_name
                .unwrap_or_else(|| "Untitled Booking".to_string()),
            created_at: escrow.created_at,
        }
    }
}

/// An escrow after funds moved out of it, with the ledger write that moved them.
#[derive(Debug, Clone, Serialize)]
pub struct EscrowSettlement {
    pub escrow: EscrowDeposit,
    pub receipt: LedgerReceipt,
}

/// Display names copied onto the revenue record when an escrow opens.
#[derive(Debug, Clone, Default)]
pub struct RevenueLabels {
    pub client_name: Option<String>,
    pub worker_name: Option<String>,
    pub booking_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revenue_rounds_half_up() {
        assert_eq!(platform_revenue(1000), 200);
        assert_eq!(platform_revenue(800), 160);
        assert_eq!(platform_revenue(3), 1); // 0.6
        assert_eq!(platform_revenue(2), 0); // 0.4
        assert_eq!(platform_revenue(5), 1); // 1.0
        assert_eq!(platform_revenue(13), 3); // 2.6
        assert_eq!(platform_revenue(12), 2); // 2.4
        assert_eq!(platform_revenue(0), 0);
        assert_eq!(worker_net(800), 640);
    }

    #[test]
    fn revenue_does_not_overflow_large_amounts() {
        assert_eq!(platform_revenue(i64::MAX), 1_844_674_407_370_955_161);
        assert_eq!(
            worker_net(i64::MAX),
            i64::MAX - 1_844_674_407_370_955_161
        );
    }

    #[test]
    fn release_requires_flip_first() {
        let mut escrow = EscrowDeposit::funded(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 800);
        assert!(matches!(escrow.ensure_releasable(), Err(ServiceError::InvalidState(_))));

        escrow
            .transition(EscrowStatus::Held, EscrowStatus::Released, None)
            .unwrap();
        assert!(escrow.ensure_releasable().is_ok());

        escrow.mark_funds_sent();
        assert!(matches!(escrow.ensure_releasable(), Err(ServiceError::AlreadyProcessed(_))));
        assert!(matches!(
            escrow.ensure_refundable(EscrowStatus::Held),
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[test]
    fn terminal_statuses_reject_transitions() {
        let mut escrow = EscrowDeposit::funded(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 500);
        escrow.mark_refunded();
        assert!(escrow.escrow_status.is_terminal());
        assert!(escrow
            .transition(EscrowStatus::Refunded, EscrowStatus::Released, None)
            .is_err());
        assert!(matches!(
            escrow.ensure_refundable(EscrowStatus::Held),
            Err(ServiceError::AlreadyProcessed(_))
        ));
    }

    #[test]
    fn disputed_escrow_records_metadata() {
        let mut escrow = EscrowDeposit::funded(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 500);
        escrow
            .transition(
                EscrowStatus::Held,
                EscrowStatus::Disputed,
                Some("No show".to_string()),
            )
            .unwrap();
        assert_eq!(escrow.dispute_reason.as_deref(), Some("No show"));
        assert!(escrow.disputed_at.is_some());
        assert_eq!(escrow.status_history.0.len(), 2);

        escrow
            .transition(EscrowStatus::Disputed, EscrowStatus::Released, None)
            .unwrap();
        assert!(escrow.dispute_resolved_at.is_some());
    }

    #[test]
    fn only_pending_escrows_expire() {
        let mut escrow = EscrowDeposit::funded(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 500);
        let later = escrow.expires_at + Duration::minutes(1);
        assert!(!escrow.expire_if_stale(later));

        escrow.status = PaymentStatus::Pending;
        assert!(!escrow.expire_if_stale(escrow.created_at));
        assert!(escrow.expire_if_stale(later));
        assert_eq!(escrow.status, PaymentStatus::Expired);
        assert!(!escrow.expire_if_stale(later));
    }
}
