// db/escrowdb.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::db::{unique_violation, DBClient};
use super::walletdb::{lock_existing_wallet, lock_or_create_wallet, post_to_wallet};
use crate::models::escrowmodels::*;
use crate::models::walletmodels::*;
use crate::service::error::ServiceError;

#[async_trait]
pub trait EscrowExt {
    /// Debits the client by `amount` and holds it against the booking. One
    /// escrow per booking; a second attempt is `AlreadyProcessed`.
    async fn open_escrow(
        &self,
        client_id: Uuid,
        worker_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        labels: RevenueLabels,
    ) -> Result<EscrowDeposit, ServiceError>;

    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowDeposit>, ServiceError>;

    async fn get_escrow_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<EscrowDeposit>, ServiceError>;

    async fn get_escrow_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<EscrowDeposit>, ServiceError>;

    /// Compare-and-set on the escrow status. No money moves.
    async fn set_escrow_status(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        reason: Option<String>,
    ) -> Result<EscrowDeposit, ServiceError>;

    /// Pays the worker their net share of a RELEASED escrow, once.
    async fn release_escrow(&self, escrow_id: Uuid) -> Result<EscrowSettlement, ServiceError>;

    /// Returns the gross amount to the client, once.
    async fn refund_escrow(
        &self,
        escrow_id: Uuid,
        expected: EscrowStatus,
    ) -> Result<EscrowSettlement, ServiceError>;

    /// Moves a stale PENDING escrow to EXPIRED and returns the current record.
    async fn expire_escrow(
        &self,
        escrow_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EscrowDeposit, ServiceError>;

    async fn expire_stale_escrows(&self, now: DateTime<Utc>) -> Result<u64, ServiceError>;

    async fn list_revenue(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RevenueRecord>, ServiceError>;
}

pub(crate) fn open_entry(escrow: &EscrowDeposit, revenue_record_id: Uuid) -> NewTransaction {
    let mut entry = NewTransaction::new(TransactionCategory::Escrow, WalletSource::Payment)
        .paid_by(escrow.client_id)
        .paid_to(escrow.worker_id)
        .booking(escrow.booking_id)
        .escrow(escrow.id)
        .notes(format!("Payment for booking {} held in escrow", escrow.booking_id));
    entry.revenue_record_id = Some(revenue_record_id);
    entry.statement_amount = Some(escrow.net_amount());
    entry
}

pub(crate) fn release_entry(escrow: &EscrowDeposit) -> NewTransaction {
    NewTransaction::new(TransactionCategory::Payment, WalletSource::Payment)
        .paid_by(escrow.client_id)
        .paid_to(escrow.worker_id)
        .booking(escrow.booking_id)
        .escrow(escrow.id)
        .notes(format!("Escrow released for booking {}", escrow.booking_id))
}

pub(crate) fn refund_entry(escrow: &EscrowDeposit) -> NewTransaction {
    NewTransaction::new(TransactionCategory::Refund, WalletSource::Refund)
        .paid_to(escrow.client_id)
        .booking(escrow.booking_id)
        .escrow(escrow.id)
        .notes(format!("Escrow refunded for booking {}", escrow.booking_id))
}

async fn lock_escrow(
    conn: &mut PgConnection,
    escrow_id: Uuid,
) -> Result<EscrowDeposit, ServiceError> {
    sqlx::query_as::<_, EscrowDeposit>("SELECT * FROM escrow_deposits WHERE id = $1 FOR UPDATE")
        .bind(escrow_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ServiceError::not_found("Escrow"))
}

async fn insert_escrow(
    conn: &mut PgConnection,
    escrow: &EscrowDeposit,
) -> Result<EscrowDeposit, ServiceError> {
    sqlx::query_as::<_, EscrowDeposit>(
        r#"
        INSERT INTO escrow_deposits
        (id, transaction_id, amount, revenue, client_id, worker_id, booking_id, status,
         escrow_status, funds_sent, refunded, created_at, expires_at, last_status_change,
         status_history)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING *
        "#,
    )
    .bind(escrow.id)
    .bind(escrow.transaction_id)
    .bind(escrow.amount)
    .bind(escrow.revenue)
    .bind(escrow.client_id)
    .bind(escrow.worker_id)
    .bind(escrow.booking_id)
    .bind(escrow.status)
    .bind(escrow.escrow_status)
    .bind(escrow.funds_sent)
    .bind(escrow.refunded)
    .bind(escrow.created_at)
    .bind(escrow.expires_at)
    .bind(escrow.last_status_change)
    .bind(&escrow.status_history)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| unique_violation(e, "Escrow already exists for this booking"))
}

async fn save_escrow(
    conn: &mut PgConnection,
    escrow: &EscrowDeposit,
) -> Result<EscrowDeposit, ServiceError> {
    let saved = sqlx::query_as::<_, EscrowDeposit>(
        r#"
        UPDATE escrow_deposits
        SET status = $2,
            escrow_status = $3,
            funds_sent = $4,
            refunded = $5,
            released_at = $6,
            refunded_at = $7,
            dispute_reason = $8,
            disputed_at = $9,
            dispute_resolved_at = $10,
            last_status_change = $11,
            status_history = $12
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(escrow.id)
    .bind(escrow.status)
    .bind(escrow.escrow_status)
    .bind(escrow.funds_sent)
    .bind(escrow.refunded)
    .bind(escrow.released_at)
    .bind(escrow.refunded_at)
    .bind(&escrow.dispute_reason)
    .bind(escrow.disputed_at)
    .bind(escrow.dispute_resolved_at)
    .bind(escrow.last_status_change)
    .bind(&escrow.status_history)
    .fetch_one(&mut *conn)
    .await?;

    Ok(saved)
}

async fn insert_revenue(
    conn: &mut PgConnection,
    record: &RevenueRecord,
) -> Result<RevenueRecord, ServiceError> {
    sqlx::query_as::<_, RevenueRecord>(
        r#"
        INSERT INTO revenue_records
        (id, escrow_id, transaction_id, amount, revenue, client_name, worker_name,
         booking_name, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(record.id)
    .bind(record.escrow_id)
    .bind(record.transaction_id)
    .bind(record.amount)
    .bind(record.revenue)
    .bind(&record.client_name)
    .bind(&record.worker_name)
    .bind(&record.booking_name)
    .bind(record.created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| unique_violation(e, "Revenue already recorded for this escrow"))
}

#[async_trait]
impl EscrowExt for DBClient {
    async fn open_escrow(
        &self,
        client_id: Uuid,
        worker_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        labels: RevenueLabels,
    ) -> Result<EscrowDeposit, ServiceError> {
        ensure_positive_amount(amount)?;
        let mut tx = self.pool.begin().await?;

        let existing: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM escrow_deposits WHERE booking_id = $1")
                .bind(booking_id)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(ServiceError::already_processed(
                "Escrow already exists for this booking",
            ));
        }

        let wallet = lock_existing_wallet(&mut tx, client_id).await?;
        if wallet.balance < amount {
            return Err(ServiceError::InsufficientFunds {
                required: amount,
                available: wallet.balance,
            });
        }

        let escrow = insert_escrow(
            &mut tx,
            &EscrowDeposit::funded(client_id, worker_id, booking_id, amount),
        )
        .await?;
        let revenue = insert_revenue(&mut tx, &RevenueRecord::for_escrow(&escrow, labels)).await?;
        post_to_wallet(
            &mut tx,
            wallet,
            amount,
            Direction::Debit,
            open_entry(&escrow, revenue.id),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            "escrow {} opened for booking {}: amount {}, revenue {}",
            escrow.id,
            booking_id,
            escrow.amount,
            escrow.revenue
        );
        Ok(escrow)
    }

    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowDeposit>, ServiceError> {
        let escrow =
            sqlx::query_as::<_, EscrowDeposit>("SELECT * FROM escrow_deposits WHERE id = $1")
                .bind(escrow_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(escrow)
    }

    async fn get_escrow_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<EscrowDeposit>, ServiceError> {
        let escrow = sqlx::query_as::<_, EscrowDeposit>(
            "SELECT * FROM escrow_deposits WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(escrow)
    }

    async fn get_escrow_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<EscrowDeposit>, ServiceError> {
        let escrow = sqlx::query_as::<_, EscrowDeposit>(
            "SELECT * FROM escrow_deposits WHERE booking_id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(escrow)
    }

    async fn set_escrow_status(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        reason: Option<String>,
    ) -> Result<EscrowDeposit, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let mut escrow = lock_escrow(&mut tx, escrow_id).await?;
        escrow.transition(from, to, reason)?;
        let escrow = save_escrow(&mut tx, &escrow).await?;
        tx.commit().await?;

        tracing::info!("escrow {} moved {:?} -> {:?}", escrow_id, from, to);
        Ok(escrow)
    }

    async fn release_escrow(&self, escrow_id: Uuid) -> Result<EscrowSettlement, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let mut escrow = lock_escrow(&mut tx, escrow_id).await?;
        escrow.ensure_releasable()?;

        let wallet = lock_or_create_wallet(&mut tx, escrow.worker_id).await?;
        let receipt = post_to_wallet(
            &mut tx,
            wallet,
            escrow.net_amount(),
            Direction::Credit,
            release_entry(&escrow),
        )
        .await?;

        escrow.mark_funds_sent();
        let escrow = save_escrow(&mut tx, &escrow).await?;
        tx.commit().await?;

        tracing::info!(
            "escrow {} released {} to worker {}",
            escrow.id,
            escrow.net_amount(),
            escrow.worker_id
        );
        Ok(EscrowSettlement { escrow, receipt })
    }

    async fn refund_escrow(
        &self,
        escrow_id: Uuid,
        expected: EscrowStatus,
    ) -> Result<EscrowSettlement, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let mut escrow = lock_escrow(&mut tx, escrow_id).await?;
        escrow.ensure_refundable(expected)?;

        let wallet = lock_or_create_wallet(&mut tx, escrow.client_id).await?;
        let receipt = post_to_wallet(
            &mut tx,
            wallet,
            escrow.amount,
            Direction::Credit,
            refund_entry(&escrow),
        )
        .await?;

        escrow.mark_refunded();
        let escrow = save_escrow(&mut tx, &escrow).await?;
        tx.commit().await?;

        tracing::info!(
            "escrow {} refunded {} to client {}",
            escrow.id,
            escrow.amount,
            escrow.client_id
        );
        Ok(EscrowSettlement { escrow, receipt })
    }

    async fn expire_escrow(
        &self,
        escrow_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EscrowDeposit, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let mut escrow = lock_escrow(&mut tx, escrow_id).await?;
        if escrow.expire_if_stale(now) {
            escrow = save_escrow(&mut tx, &escrow).await?;
        }
        tx.commit().await?;
        Ok(escrow)
    }

    async fn expire_stale_escrows(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut tx = self.pool.begin().await?;

        let stale = sqlx::query_as::<_, EscrowDeposit>(
            r#"
            SELECT * FROM escrow_deposits
            WHERE status = 'PENDING' AND expires_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut expired = 0;
        for mut escrow in stale {
            if escrow.expire_if_stale(now) {
                save_escrow(&mut tx, &escrow).await?;
                expired += 1;
            }
        }

        tx.commit().await?;
        Ok(expired)
    }

    async fn list_revenue(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RevenueRecord>, ServiceError> {
        let rows = sqlx::query_as::<_, RevenueRecord>(
            r#"
            SELECT * FROM revenue_records
            WHERE created_at >= $1 AND created_at <= $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
