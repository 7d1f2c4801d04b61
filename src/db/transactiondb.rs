// db/transactiondb.rs
use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use super::db::DBClient;
use super::walletdb::{
    insert_log, insert_statement, lock_existing_wallet, lock_or_create_wallet, post_to_wallet,
    save_balance,
};
use crate::models::walletmodels::*;
use crate::service::error::ServiceError;

/// Gateway-facing side of the transaction log: entries that are written as
/// `pending` and settled later by a callback or a status poll.
#[async_trait]
pub trait TransactionExt {
    /// Records a pending deposit. No balance changes until it settles.
    async fn create_pending_transaction(
        &self,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<TransactionLog, ServiceError>;

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionLog>, ServiceError>;

    /// Marks a pending deposit successful and credits the payee, creating the
    /// wallet if needed. Unknown or already settled references are `NotFound`.
    async fn settle_deposit(&self, reference: &str) -> Result<LedgerReceipt, ServiceError>;

    async fn fail_pending_transaction(
        &self,
        reference: &str,
        reason: &str,
    ) -> Result<TransactionLog, ServiceError>;

    /// Attaches the gateway's id to a pending entry that has none yet.
    /// Attaches the gateway reference to a pending entry. Re-attaching the
    /// same reference is a no-op; a different one is `NotFound`.
    async fn set_transaction_reference(
        &self,
        transaction_id: Uuid,
        reference: &str,
    ) -> Result<TransactionLog, ServiceError>;

    async fn settle_payout(&self, transaction_id: Uuid) -> Result<TransactionLog, ServiceError>;

    /// Fails a pending payout and returns the funds to the payer's wallet.
    async fn reverse_payout(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<LedgerReceipt, ServiceError>;

    /// Pending payouts, including ones whose gateway reference was never
    /// attached.
    async fn list_pending_payouts(&self) -> Result<Vec<TransactionLog>, ServiceError>;

    async fn list_transactions_for_escrow(
        &self,
        escrow_id: Uuid,
    ) -> Result<Vec<TransactionLog>, ServiceError>;
}

pub(crate) fn ensure_pending(log: &TransactionLog) -> Result<(), ServiceError> {
    if log.status != TransactionStatus::Pending {
        return Err(ServiceError::not_found("Pending transaction"));
    }
    Ok(())
}

pub(crate) fn refund_entry(payout: &TransactionLog, reason: &str) -> NewTransaction {
    let mut entry = NewTransaction::new(TransactionCategory::Refund, WalletSource::Refund)
        .notes(format!("Payout reversed: {}", reason));
    entry.paid_to = payout.paid_by;
    entry
}

async fn lock_by_reference(
    conn: &mut PgConnection,
    reference: &str,
) -> Result<TransactionLog, ServiceError> {
    let log = sqlx::query_as::<_, TransactionLog>(
        "SELECT * FROM transaction_logs WHERE reference_id = $1 FOR UPDATE",
    )
    .bind(reference)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ServiceError::not_found("Transaction"))?;

    ensure_pending(&log)?;
    Ok(log)
}

async fn lock_by_id(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<TransactionLog, ServiceError> {
    let log = sqlx::query_as::<_, TransactionLog>(
        "SELECT * FROM transaction_logs WHERE id = $1 FOR UPDATE",
    )
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ServiceError::not_found("Transaction"))?;

    ensure_pending(&log)?;
    Ok(log)
}

async fn set_status(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    status: TransactionStatus,
) -> Result<TransactionLog, ServiceError> {
    let log = sqlx::query_as::<_, TransactionLog>(
        r#"
        UPDATE transaction_logs
        SET status = $2, updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        RETURNING *
        "#,
    )
    .bind(transaction_id)
    .bind(status)
    .fetch_one(&mut *conn)
    .await?;

    Ok(log)
}

#[async_trait]
impl TransactionExt for DBClient {
    async fn create_pending_transaction(
        &self,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<TransactionLog, ServiceError> {
        ensure_positive_amount(amount)?;
        let log = entry.pending().log_entry(amount, Direction::Credit);
        let mut conn = self.pool.acquire().await?;
        insert_log(&mut conn, &log).await
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionLog>, ServiceError> {
        let log = sqlx::query_as::<_, TransactionLog>(
            "SELECT * FROM transaction_logs WHERE reference_id = $1",
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(log)
    }

    async fn settle_deposit(&self, reference: &str) -> Result<LedgerReceipt, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_by_reference(&mut tx, reference).await?;
        let owner = pending
            .paid_to
            .ok_or_else(|| ServiceError::invalid_state("Deposit has no recipient"))?;

        let mut wallet = lock_or_create_wallet(&mut tx, owner).await?;
        wallet.apply(pending.amount, Direction::Credit)?;
        let wallet = save_balance(&mut tx, &wallet).await?;

        let transaction = set_status(&mut tx, pending.id, TransactionStatus::Success).await?;
        let line = statement_line(&wallet, &transaction, WalletSource::Deposit, None);
        let statement = insert_statement(&mut tx, &line).await?;

        tx.commit().await?;

        Ok(LedgerReceipt {
            wallet,
            transaction,
            statement,
        })
    }

    async fn fail_pending_transaction(
        &self,
        reference: &str,
        reason: &str,
    ) -> Result<TransactionLog, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let pending = lock_by_reference(&mut tx, reference).await?;
        let log = set_status(&mut tx, pending.id, TransactionStatus::Failed).await?;
        tx.commit().await?;
        tracing::info!("transaction {} marked failed: {}", reference, reason);
        Ok(log)
    }

    async fn set_transaction_reference(
        &self,
        transaction_id: Uuid,
        reference: &str,
    ) -> Result<TransactionLog, ServiceError> {
        let log = sqlx::query_as::<_, TransactionLog>(
            r#"
            UPDATE transaction_logs
            SET reference_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
              AND (reference_id IS NULL OR reference_id = $2)
            RETURNING *
            "#,
        )
        .bind(transaction_id)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| super::db::unique_violation(e, "Transaction reference already used"))?;

        log.ok_or_else(|| ServiceError::not_found("Pending transaction"))
    }

    async fn settle_payout(&self, transaction_id: Uuid) -> Result<TransactionLog, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let pending = lock_by_id(&mut tx, transaction_id).await?;
        let log = set_status(&mut tx, pending.id, TransactionStatus::Success).await?;
        tx.commit().await?;
        Ok(log)
    }

    async fn reverse_payout(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<LedgerReceipt, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let pending = lock_by_id(&mut tx, transaction_id).await?;
        let owner = pending
            .paid_by
            .ok_or_else(|| ServiceError::invalid_state("Payout has no payer"))?;

        set_status(&mut tx, pending.id, TransactionStatus::Failed).await?;

        let wallet = lock_existing_wallet(&mut tx, owner).await?;
        let receipt = post_to_wallet(
            &mut tx,
            wallet,
            pending.amount,
            Direction::Credit,
            refund_entry(&pending, reason),
        )
        .await?;

        tx.commit().await?;
        Ok(receipt)
    }

    async fn list_pending_payouts(&self) -> Result<Vec<TransactionLog>, ServiceError> {
        let rows = sqlx::query_as::<_, TransactionLog>(
            r#"
            SELECT * FROM transaction_logs
            WHERE status = 'pending' AND category = 'payout'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_transactions_for_escrow(
        &self,
        escrow_id: Uuid,
    ) -> Result<Vec<TransactionLog>, ServiceError> {
        let rows = sqlx::query_as::<_, TransactionLog>(
            "SELECT * FROM transaction_logs WHERE escrow_id = $1 ORDER BY created_at ASC",
        )
        .bind(escrow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
