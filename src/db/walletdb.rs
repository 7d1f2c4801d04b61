// db/walletdb.rs
use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::walletmodels::*;
use crate::service::error::ServiceError;

#[async_trait]
pub trait WalletExt {
    /// Returns the existing wallet when the user already has one.
    async fn create_wallet(&self, user_id: Uuid) -> Result<Wallet, ServiceError>;

    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, ServiceError>;

    async fn credit_wallet(
        &self,
        user_id: Uuid,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError>;

    async fn debit_wallet(
        &self,
        user_id: Uuid,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError>;

    async fn transfer_funds(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        amount: i64,
        notes: Option<String>,
    ) -> Result<TransferReceipt, ServiceError>;

    async fn get_wallet_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WalletTransaction>, ServiceError>;
}

/// The two halves of a transfer, sharing one transfer id.
pub(crate) fn transfer_entries(
    sender_id: Uuid,
    recipient_id: Uuid,
    notes: Option<String>,
) -> (NewTransaction, NewTransaction) {
    let transfer_id = Uuid::new_v4();
    let notes = notes.unwrap_or_else(|| "Wallet transfer".to_string());
    let base = NewTransaction::new(TransactionCategory::WalletTransfer, WalletSource::Transfer)
        .paid_by(sender_id)
        .paid_to(recipient_id)
        .transfer(transfer_id)
        .notes(notes);
    (base.clone(), base)
}

pub(crate) async fn lock_wallet(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Option<Wallet>, ServiceError> {
    let wallet = sqlx::query_as::<_, Wallet>(
        r#"
        SELECT id, user_id, balance, created_at, updated_at
        FROM wallets
        WHERE user_id = $1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(wallet)
}

pub(crate) async fn lock_existing_wallet(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Wallet, ServiceError> {
    lock_wallet(conn, user_id)
        .await?
        .ok_or_else(|| ServiceError::not_found("Wallet"))
}

/// Locks the wallet, creating an empty one first if the user has none.
pub(crate) async fn lock_or_create_wallet(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Wallet, ServiceError> {
    let fresh = Wallet::new(user_id);
    sqlx::query(
        r#"
        INSERT INTO wallets (id, user_id, balance, created_at, updated_at)
        VALUES ($1, $2, 0, $3, $3)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(fresh.id)
    .bind(user_id)
    .bind(fresh.created_at)
    .execute(&mut *conn)
    .await?;

    lock_existing_wallet(conn, user_id).await
}

pub(crate) async fn insert_log(
    conn: &mut PgConnection,
    log: &TransactionLog,
) -> Result<TransactionLog, ServiceError> {
    let saved = sqlx::query_as::<_, TransactionLog>(
        r#"
        INSERT INTO transaction_logs
        (id, amount, direction, category, status, paid_by, paid_to, booking_id, escrow_id,
         revenue_record_id, reference_id, transfer_id, notes, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING *
        "#,
    )
    .bind(log.id)
    .bind(log.amount)
    .bind(log.direction)
    .bind(log.category)
    .bind(log.status)
    .bind(log.paid_by)
    .bind(log.paid_to)
    .bind(log.booking_id)
    .bind(log.escrow_id)
    .bind(log.revenue_record_id)
    .bind(&log.reference_id)
    .bind(log.transfer_id)
    .bind(&log.notes)
    .bind(log.created_at)
    .bind(log.updated_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| super::db::unique_violation(e, "Transaction reference already used"))?;

    Ok(saved)
}

pub(crate) async fn insert_statement(
    conn: &mut PgConnection,
    line: &WalletTransaction,
) -> Result<WalletTransaction, ServiceError> {
    let saved = sqlx::query_as::<_, WalletTransaction>(
        r#"
        INSERT INTO wallet_transactions
        (id, wallet_id, user_id, amount, entry_type, source, booking_id,
         linked_transaction_id, notes, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(line.id)
    .bind(line.wallet_id)
    .bind(line.user_id)
    .bind(line.amount)
    .bind(line.entry_type)
    .bind(line.source)
    .bind(line.booking_id)
    .bind(line.linked_transaction_id)
    .bind(&line.notes)
    .bind(line.created_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(saved)
}

pub(crate) async fn save_balance(
    conn: &mut PgConnection,
    wallet: &Wallet,
) -> Result<Wallet, ServiceError> {
    let saved = sqlx::query_as::<_, Wallet>(
        r#"
        UPDATE wallets
        SET balance = $2, updated_at = $3
        WHERE id = $1
        RETURNING id, user_id, balance, created_at, updated_at
        "#,
    )
    .bind(wallet.id)
    .bind(wallet.balance)
    .bind(wallet.updated_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(saved)
}

/// Applies one balance change to a locked wallet and writes its log entry and
/// statement line. Must run inside the transaction that holds the lock.
pub(crate) async fn post_to_wallet(
    conn: &mut PgConnection,
    mut wallet: Wallet,
    amount: i64,
    direction: Direction,
    entry: NewTransaction,
) -> Result<LedgerReceipt, ServiceError> {
    ensure_positive_amount(amount)?;
    wallet.apply(amount, direction)?;
    let (log, line) = entry.into_records(&wallet, amount, direction);

    let wallet = save_balance(conn, &wallet).await?;
    let transaction = insert_log(conn, &log).await?;
    let statement = insert_statement(conn, &line).await?;

    Ok(LedgerReceipt {
        wallet,
        transaction,
        statement,
    })
}

#[async_trait]
impl WalletExt for DBClient {
    async fn create_wallet(&self, user_id: Uuid) -> Result<Wallet, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_or_create_wallet(&mut tx, user_id).await?;
        tx.commit().await?;
        Ok(wallet)
    }

    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, ServiceError> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT id, user_id, balance, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn credit_wallet(
        &self,
        user_id: Uuid,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_existing_wallet(&mut tx, user_id).await?;
        let receipt = post_to_wallet(&mut tx, wallet, amount, Direction::Credit, entry).await?;
        tx.commit().await?;
        Ok(receipt)
    }

    async fn debit_wallet(
        &self,
        user_id: Uuid,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let wallet = lock_existing_wallet(&mut tx, user_id).await?;
        let receipt = post_to_wallet(&mut tx, wallet, amount, Direction::Debit, entry).await?;
        tx.commit().await?;
        Ok(receipt)
    }

    async fn transfer_funds(
        &self,
        sender_id: Uuid,
        recipient_id: Uuid,
        amount: i64,
        notes: Option<String>,
    ) -> Result<TransferReceipt, ServiceError> {
        if sender_id == recipient_id {
            return Err(ServiceError::validation("Cannot transfer to the same wallet"));
        }
        ensure_positive_amount(amount)?;

        let mut tx = self.pool.begin().await?;

        // lock in id order so opposing transfers cannot deadlock
        let (first, second) = if sender_id < recipient_id {
            (sender_id, recipient_id)
        } else {
            (recipient_id, sender_id)
        };
        let first_wallet = lock_existing_wallet(&mut tx, first).await?;
        let second_wallet = lock_existing_wallet(&mut tx, second).await?;
        let (sender_wallet, recipient_wallet) = if first == sender_id {
            (first_wallet, second_wallet)
        } else {
            (second_wallet, first_wallet)
        };

        let (debit_entry, credit_entry) = transfer_entries(sender_id, recipient_id, notes);
        let transfer_id = debit_entry.transfer_id.unwrap_or_default();

        let sender =
            post_to_wallet(&mut tx, sender_wallet, amount, Direction::Debit, debit_entry).await?;
        let recipient =
            post_to_wallet(&mut tx, recipient_wallet, amount, Direction::Credit, credit_entry)
                .await?;

        tx.commit().await?;

        Ok(TransferReceipt {
            transfer_id,
            sender,
            recipient,
        })
    }

    async fn get_wallet_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<WalletTransaction>, ServiceError> {
        let rows = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, wallet_id, user_id, amount, entry_type, source, booking_id,
                   linked_transaction_id, notes, created_at
            FROM wallet_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
