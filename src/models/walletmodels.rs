// models/walletmodels.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service::error::ServiceError;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "entry_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionCategory {
    Deposit,
    Payment,
    Payout,
    Refund,
    Escrow,
    WalletTransfer,
    AdminTopup,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "wallet_source", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WalletSource {
    Deposit,
    Payment,
    Payout,
    Refund,
    Revenue,
    Transfer,
    Withdrawal,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable audit record of one money movement.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TransactionLog {
    pub id: Uuid,
    pub amount: i64,
    pub direction: Direction,
    pub category: TransactionCategory,
    pub status: TransactionStatus,
    pub paid_by: Option<Uuid>,
    pub paid_to: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub escrow_id: Option<Uuid>,
    pub revenue_record_id: Option<Uuid>,
    pub reference_id: Option<String>,
    pub transfer_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Statement line against a single wallet.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub entry_type: Direction,
    pub source: WalletSource,
    pub booking_id: Option<Uuid>,
    pub linked_transaction_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything a ledger write needs to describe itself. The store fills in the
/// amount and direction from the operation it performs.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub category: TransactionCategory,
    pub status: TransactionStatus,
    pub source: WalletSource,
    pub paid_by: Option<Uuid>,
    pub paid_to: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub escrow_id: Option<Uuid>,
    pub reference_id: Option<String>,
    pub revenue_record_id: Option<Uuid>,
    pub transfer_id: Option<Uuid>,
    pub notes: Option<String>,
    /// Overrides the statement line amount when it differs from the balance change.
    pub statement_amount: Option<i64>,
}

impl NewTransaction {
    pub fn new(category: TransactionCategory, source: WalletSource) -> Self {
        Self {
            category,
            status: TransactionStatus::Success,
            source,
            paid_by: None,
            paid_to: None,
            booking_id: None,
            escrow_id: None,
            reference_id: None,
            revenue_record_id: None,
            transfer_id: None,
            notes: None,
            statement_amount: None,
        }
    }

    pub fn pending(mut self) -> Self {
        self.status = TransactionStatus::Pending;
        self
    }

    pub fn paid_by(mut self, user_id: Uuid) -> Self {
        self.paid_by = Some(user_id);
        self
    }

    pub fn paid_to(mut self, user_id: Uuid) -> Self {
        self.paid_to = Some(user_id);
        self
    }

    pub fn booking(mut self, booking_id: Uuid) -> Self {
        self.booking_id = Some(booking_id);
        self
    }

    pub fn escrow(mut self, escrow_id: Uuid) -> Self {
        self.escrow_id = Some(escrow_id);
        self
    }

    pub fn reference(mut self, reference: impl Into<String>) -> Self {
        self.reference_id = Some(reference.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn transfer(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    /// Builds the log entry for a movement that has not touched a wallet yet,
    /// such as a deposit waiting on its gateway callback.
    pub fn log_entry(&self, amount: i64, direction: Direction) -> TransactionLog {
        let now = Utc::now();
        TransactionLog {
            id: Uuid::new_v4(),
            amount,
            direction,
            category: self.category,
            status: self.status,
            paid_by: self.paid_by,
            paid_to: self.paid_to,
            booking_id: self.booking_id,
            escrow_id: self.escrow_id,
            revenue_record_id: self.revenue_record_id,
            reference_id: self.reference_id.clone(),
            transfer_id: self.transfer_id,
            notes: self.notes.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Log entry plus the statement line for a change to `wallet`.
    pub fn into_records(
        self,
        wallet: &Wallet,
        amount: i64,
        direction: Direction,
    ) -> (TransactionLog, WalletTransaction) {
        let log = self.log_entry(amount, direction);
        let statement = statement_line(wallet, &log, self.source, self.statement_amount);
        (log, statement)
    }
}

pub fn statement_line(
    wallet: &Wallet,
    log: &TransactionLog,
    source: WalletSource,
    amount: Option<i64>,
) -> WalletTransaction {
    WalletTransaction {
        id: Uuid::new_v4(),
        wallet_id: wallet.id,
        user_id: wallet.user_id,
        amount: amount.unwrap_or(log.amount),
        entry_type: log.direction,
        source,
        booking_id: log.booking_id,
        linked_transaction_id: Some(log.id),
        notes: log.notes.clone(),
        created_at: log.updated_at,
    }
}

impl Wallet {
    pub fn new(user_id: Uuid) -> Self {
        let now = Utc::now();
        Wallet {
            id: Uuid::new_v4(),
            user_id,
            balance: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a signed change, refusing to go below zero.
    pub fn apply(&mut self, amount: i64, direction: Direction) -> Result<(), ServiceError> {
        match direction {
            Direction::Credit => {
                self.balance = self.balance.checked_add(amount).ok_or_else(|| {
                    ServiceError::validation("Credit would exceed the maximum wallet balance")
                })?;
            }
            Direction::Debit => {
                if self.balance < amount {
                    return Err(ServiceError::InsufficientFunds {
                        required: amount,
                        available: self.balance,
                    });
                }
                self.balance -= amount;
            }
        }
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Result of a single-sided ledger write: the wallet after the change plus
/// the two records describing it.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerReceipt {
    pub wallet: Wallet,
    pub transaction: TransactionLog,
    pub statement: WalletTransaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub transfer_id: Uuid,
    pub sender: LedgerReceipt,
    pub recipient: LedgerReceipt,
}

/// Largest amount a single ledger operation may move.
pub const MAX_TRANSACTION_AMOUNT: i64 = 1_000_000_000_000;

pub fn ensure_positive_amount(amount: i64) -> Result<(), ServiceError> {
    if amount <= 0 {
        return Err(ServiceError::validation("Amount must be greater than zero"));
    }
    if amount > MAX_TRANSACTION_AMOUNT {
        return Err(ServiceError::validation(format!(
            "Amount must be at most {}",
            MAX_TRANSACTION_AMOUNT
        )));
    }
    Ok(())
}

pub fn generate_transaction_reference() -> String {
    format!(
        "NSC_{}",
        uuid::Uuid::new_v4().to_string().replace('-', "").to_uppercase()[..16].to_string()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_prefixed_and_unique() {
        let a = generate_transaction_reference();
        let b = generate_transaction_reference();
        assert!(a.starts_with("NSC_"));
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }

    #[test]
    fn debits_never_clamp() {
        let mut wallet = Wallet::new(Uuid::new_v4());
        wallet.apply(300, Direction::Credit).unwrap();
        let err = wallet.apply(800, Direction::Debit).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InsufficientFunds { required: 800, available: 300 }
        ));
        assert_eq!(wallet.balance, 300);
        wallet.apply(300, Direction::Debit).unwrap();
        assert_eq!(wallet.balance, 0);
    }

    #[test]
    fn credits_at_the_limit_are_rejected() {
        let mut wallet = Wallet::new(Uuid::new_v4());
        wallet.apply(i64::MAX, Direction::Credit).unwrap();
        let err = wallet.apply(1, Direction::Credit).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(wallet.balance, i64::MAX);

        assert!(ensure_positive_amount(MAX_TRANSACTION_AMOUNT).is_ok());
        assert!(matches!(
            ensure_positive_amount(MAX_TRANSACTION_AMOUNT + 1),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn statement_amount_can_differ_from_log() {
        let wallet = Wallet::new(Uuid::new_v4());
        let mut entry = NewTransaction::new(TransactionCategory::Escrow, WalletSource::Payment)
            .paid_by(wallet.user_id)
            .notes("held");
        entry.statement_amount = Some(640);
        let (log, line) = entry.into_records(&wallet, 800, Direction::Debit);
        assert_eq!(log.amount, 800);
        assert_eq!(line.amount, 640);
        assert_eq!(line.linked_transaction_id, Some(log.id));
        assert_eq!(line.entry_type, Direction::Debit);
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        assert!(ensure_positive_amount(0).is_err());
        assert!(ensure_positive_amount(-5).is_err());
        assert!(ensure_positive_amount(1).is_ok());
    }
}
