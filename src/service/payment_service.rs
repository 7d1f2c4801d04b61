// service/payment_service.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    db::{Store, TransactionExt, WalletExt},
    models::{
        notificationmodel::NotificationCategory,
        usermodel::Principal,
        walletmodels::*,
    },
    service::{
        error::ServiceError,
        notification_service::NotificationDispatcher,
        payment_provider::{MobileMoneyGateway, PayoutGateway, PayoutStatus, MIN_DEPOSIT_AMOUNT},
    },
};

/// Gateway callback reduced to what settlement needs.
#[derive(Debug, Clone)]
pub struct DepositCallback {
    pub reference: String,
    pub result_code: i64,
    pub result_desc: Option<String>,
    pub amount: Option<i64>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Credited { receipt: LedgerReceipt },
    Failed { transaction: TransactionLog },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PayoutSweep {
    pub settled: usize,
    pub reversed: usize,
    pub pending: usize,
    /// Debited payouts with no gateway reference to poll.
    pub unreferenced: usize,
}

const REFERENCE_ATTACH_ATTEMPTS: u32 = 3;
/// Unreferenced payouts younger than this are probably still being submitted.
const REFERENCE_GRACE_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct PaymentService {
    store: Arc<dyn Store>,
    mobile_money: Arc<dyn MobileMoneyGateway>,
    payouts: Arc<dyn PayoutGateway>,
    notifications: NotificationDispatcher,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        mobile_money: Arc<dyn MobileMoneyGateway>,
        payouts: Arc<dyn PayoutGateway>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            mobile_money,
            payouts,
            notifications,
        }
    }

    /// Sends the STK push and records a pending deposit against its reference.
    pub async fn request_deposit(
        &self,
        principal: &Principal,
        phone: &str,
        amount: i64,
    ) -> Result<TransactionLog, ServiceError> {
        if amount < MIN_DEPOSIT_AMOUNT {
            return Err(ServiceError::validation(format!(
                "Amount must be at least {}",
                MIN_DEPOSIT_AMOUNT
            )));
        }

        let reference = self.mobile_money.initiate_deposit(phone, amount).await?;
        let entry = NewTransaction::new(TransactionCategory::Deposit, WalletSource::Deposit)
            .paid_by(principal.id)
            .paid_to(principal.id)
            .reference(reference)
            .notes("Deposit via M-Pesa");

        let pending = self.store.create_pending_transaction(amount, entry).await?;
        tracing::info!(
            "deposit {} of {} pending for {}",
            pending.id,
            amount,
            principal.id
        );
        Ok(pending)
    }

    /// Settles a pending deposit from the gateway callback. Unknown or already
    /// processed references are `NotFound`.
    pub async fn handle_deposit_callback(
        &self,
        callback: DepositCallback,
    ) -> Result<CallbackOutcome, ServiceError> {
        if callback.result_code != 0 {
            let reason = callback
                .result_desc
                .unwrap_or_else(|| "STK push failed".to_string());
            let transaction = self
                .store
                .fail_pending_transaction(&callback.reference, &reason)
                .await?;
            if let Some(user_id) = transaction.paid_to {
                self.notifications.notify(
                    user_id,
                    format!("Your deposit of {} failed: {}", transaction.amount, reason),
                    NotificationCategory::Payment,
                    None,
                );
            }
            return Ok(CallbackOutcome::Failed { transaction });
        }

        let receipt = self.store.settle_deposit(&callback.reference).await?;
        if let Some(reported) = callback.amount {
            if reported != receipt.transaction.amount {
                tracing::warn!(
                    "deposit {} callback reported {} but {} was requested",
                    callback.reference,
                    reported,
                    receipt.transaction.amount
                );
            }
        }

        tracing::info!(
            "deposit {} credited {} to {} from {}",
            callback.reference,
            receipt.transaction.amount,
            receipt.wallet.user_id,
            callback.phone.as_deref().unwrap_or("unknown phone")
        );
        self.notifications.notify(
            receipt.wallet.user_id,
            format!("Deposit of {} received", receipt.transaction.amount),
            NotificationCategory::Payment,
            None,
        );
        Ok(CallbackOutcome::Credited { receipt })
    }

    /// Debits the wallet with a pending payout, then asks the gateway to pay.
    /// A gateway failure puts the funds back.
    pub async fn withdraw(
        &self,
        principal: &Principal,
        destination: &str,
        amount: i64,
    ) -> Result<TransactionLog, ServiceError> {
        ensure_positive_amount(amount)?;

        let entry = NewTransaction::new(TransactionCategory::Payout, WalletSource::Withdrawal)
            .pending()
            .paid_by(principal.id)
            .notes(format!("Withdrawal to {}", destination));
        let debit = self.store.debit_wallet(principal.id, amount, entry).await?;
        let payout_id = debit.transaction.id;

        let note = format!("Payout for {}", principal.id);
        match self.payouts.create_payout(destination, amount, &note).await {
            Ok(batch_id) => match self.attach_payout_reference(payout_id, &batch_id).await {
                Ok(payout) => {
                    tracing::info!("withdrawal {} submitted as batch {}", payout_id, batch_id);
                    Ok(payout)
                }
                // The gateway has the money; reversing here could pay out twice.
                Err(e) => {
                    tracing::error!(
                        "withdrawal {} was submitted as batch {} but the reference could not be saved: {}",
                        payout_id,
                        batch_id,
                        e
                    );
                    Ok(debit.transaction)
                }
            },
            Err(e) => {
                tracing::error!("payout request for {} failed: {}", payout_id, e);
                self.store
                    .reverse_payout(payout_id, "Payout request failed")
                    .await?;
                Err(e.into())
            }
        }
    }

    async fn attach_payout_reference(
        &self,
        payout_id: Uuid,
        batch_id: &str,
    ) -> Result<TransactionLog, ServiceError> {
        let mut attempt = 1;
        loop {
            match self.store.set_transaction_reference(payout_id, batch_id).await {
                Ok(payout) => return Ok(payout),
                Err(e) if e.is_retryable() && attempt < REFERENCE_ATTACH_ATTEMPTS => {
                    tracing::warn!(
                        "attaching batch {} to withdrawal {} failed (attempt {}): {}",
                        batch_id,
                        payout_id,
                        attempt,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Checks every submitted payout once and settles or reverses it. Payouts
    /// without a gateway reference are reported, never reversed.
    pub async fn poll_payouts(&self) -> Result<PayoutSweep, ServiceError> {
        let mut sweep = PayoutSweep::default();
        let grace = Utc::now() - chrono::Duration::minutes(REFERENCE_GRACE_MINUTES);

        for payout in self.store.list_pending_payouts().await? {
            let Some(batch_id) = payout.reference_id.as_deref() else {
                sweep.unreferenced += 1;
                if payout.created_at < grace {
                    tracing::error!(
                        "withdrawal {} of {} has no payout batch; reconcile it with the gateway",
                        payout.id,
                        payout.amount
                    );
                }
                continue;
            };

            let status = match self.payouts.payout_status(batch_id).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::error!("could not check payout {}: {}", batch_id, e);
                    sweep.pending += 1;
                    continue;
                }
            };

            match status {
                PayoutStatus::Pending => sweep.pending += 1,
                PayoutStatus::Success => {
                    self.store.settle_payout(payout.id).await?;
                    sweep.settled += 1;
                    if let Some(user_id) = payout.paid_by {
                        self.notifications.notify(
                            user_id,
                            format!("Withdrawal of {} completed", payout.amount),
                            NotificationCategory::Payment,
                            None,
                        );
                    }
                }
                PayoutStatus::Denied => {
                    self.store.reverse_payout(payout.id, "Payout denied").await?;
                    sweep.reversed += 1;
                    if let Some(user_id) = payout.paid_by {
                        self.notifications.notify(
                            user_id,
                            format!("Withdrawal of {} was denied and refunded", payout.amount),
                            NotificationCategory::Payment,
                            None,
                        );
                    }
                }
            }
        }

        Ok(sweep)
    }
}
