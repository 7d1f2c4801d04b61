// db/memory.rs
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::bookingdb::{lost_race, BookingExt};
use super::escrowdb::{open_entry, refund_entry, release_entry, EscrowExt};
use super::notificationdb::NotificationExt;
use super::transactiondb::{self, ensure_pending, TransactionExt};
use super::userdb::UserExt;
use super::walletdb::{transfer_entries, WalletExt};
use crate::models::bookingmodel::*;
use crate::models::escrowmodels::*;
use crate::models::notificationmodel::Notification;
use crate::models::usermodel::{User, UserRole};
use crate::models::walletmodels::*;
use crate::service::error::ServiceError;

type Cell<T> = Arc<Mutex<T>>;

fn cell<T>(value: T) -> Cell<T> {
    Arc::new(Mutex::new(value))
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-local store with the same atomicity as the Postgres client: every
/// record sits behind its own async mutex, and ledger writes happen while the
/// affected wallet is locked. Escrows are always locked before wallets, and
/// transfers lock wallets in id order.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    completed_bookings: DashMap<Uuid, HashSet<Uuid>>,
    wallets: DashMap<Uuid, Cell<Wallet>>,
    escrows: DashMap<Uuid, Cell<EscrowDeposit>>,
    escrow_by_booking: DashMap<Uuid, Uuid>,
    escrow_by_transaction: DashMap<Uuid, Uuid>,
    revenue: RwLock<Vec<RevenueRecord>>,
    logs: DashMap<Uuid, Cell<TransactionLog>>,
    log_by_reference: DashMap<String, Uuid>,
    statements: RwLock<Vec<WalletTransaction>>,
    bookings: DashMap<Uuid, Cell<Booking>>,
    reviews: DashMap<Uuid, Review>,
    notifications: RwLock<Vec<Notification>>,
    #[cfg(test)]
    reference_failures: std::sync::atomic::AtomicUsize,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("users", &self.users.len())
            .field("wallets", &self.wallets.len())
            .field("escrows", &self.escrows.len())
            .field("bookings", &self.bookings.len())
            .field("logs", &self.logs.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn completed_bookings(&self, worker_id: Uuid) -> Vec<Uuid> {
        self.completed_bookings
            .get(&worker_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn insert_escrow(&self, escrow: EscrowDeposit) {
        self.escrow_by_booking.insert(escrow.booking_id, escrow.id);
        self.escrow_by_transaction
            .insert(escrow.transaction_id, escrow.id);
        self.escrows.insert(escrow.id, cell(escrow));
    }

    /// Makes the next `count` reference attaches fail with a storage error.
    #[cfg(test)]
    pub(crate) fn fail_reference_attaches(&self, count: usize) {
        self.reference_failures
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_reference_failure(&self) -> bool {
        use std::sync::atomic::Ordering;
        self.reference_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    #[cfg(test)]
    pub(crate) async fn all_logs(&self) -> Vec<TransactionLog> {
        let cells: Vec<_> = self.logs.iter().map(|r| r.value().clone()).collect();
        let mut logs = Vec::with_capacity(cells.len());
        for log in cells {
            logs.push(log.lock().await.clone());
        }
        logs.sort_by_key(|log| log.created_at);
        logs
    }

    fn wallet_cell(&self, user_id: Uuid) -> Result<Cell<Wallet>, ServiceError> {
        self.wallets
            .get(&user_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ServiceError::not_found("Wallet"))
    }

    fn wallet_cell_or_create(&self, user_id: Uuid) -> Cell<Wallet> {
        self.wallets
            .entry(user_id)
            .or_insert_with(|| cell(Wallet::new(user_id)))
            .value()
            .clone()
    }

    fn escrow_cell(&self, escrow_id: Uuid) -> Result<Cell<EscrowDeposit>, ServiceError> {
        self.escrows
            .get(&escrow_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ServiceError::not_found("Escrow"))
    }

    fn booking_cell(&self, booking_id: Uuid) -> Result<Cell<Booking>, ServiceError> {
        self.bookings
            .get(&booking_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ServiceError::not_found("Booking"))
    }

    fn log_cell(&self, transaction_id: Uuid) -> Result<Cell<TransactionLog>, ServiceError> {
        self.logs
            .get(&transaction_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| ServiceError::not_found("Transaction"))
    }

    fn log_cell_by_reference(&self, reference: &str) -> Result<Cell<TransactionLog>, ServiceError> {
        let id = self
            .log_by_reference
            .get(reference)
            .map(|r| *r.value())
            .ok_or_else(|| ServiceError::not_found("Transaction"))?;
        self.log_cell(id)
    }

    fn append_log(&self, log: TransactionLog) -> Result<TransactionLog, ServiceError> {
        if let Some(reference) = &log.reference_id {
            match self.log_by_reference.entry(reference.clone()) {
                Entry::Occupied(_) => {
                    return Err(ServiceError::already_processed(
                        "Transaction reference already used",
                    ))
                }
                Entry::Vacant(slot) => {
                    slot.insert(log.id);
                }
            }
        }
        self.logs.insert(log.id, cell(log.clone()));
        Ok(log)
    }

    fn append_statement(&self, line: WalletTransaction) -> WalletTransaction {
        write(&self.statements).push(line.clone());
        line
    }

    /// Applies one balance change to a locked wallet plus its records. Nothing
    /// is written when the change is rejected.
    fn post(
        &self,
        wallet: &mut Wallet,
        amount: i64,
        direction: Direction,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError> {
        ensure_positive_amount(amount)?;
        let mut next = wallet.clone();
        next.apply(amount, direction)?;

        let (log, line) = entry.into_records(&next, amount, direction);
        let transaction = self.append_log(log)?;
        let statement = self.append_statement(line);
        *wallet = next;

        Ok(LedgerReceipt {
            wallet: wallet.clone(),
            transaction,
            statement,
        })
    }

    async fn collect<T: Clone>(cells: Vec<Cell<T>>) -> Vec<T> {
        let mut values = Vec::with_capacity(cells.len());
        for c in cells {
            values.push(c.lock().await.clone());
        }
        values
    }
}

#[async_trait]
impl UserExt for MemoryStore {
    async fn get_user(&self, user_id: Uuid) -> Result<Option<User>, ServiceError> {
        Ok(self.users.get(&user_id).map(|r| r.value().clone()))
    }

    async fn find_available_worker(&self, service: &str) -> Result<Option<User>, ServiceError> {
        let worker = self
            .users
            .iter()
            .filter(|r| {
                let user = r.value();
                user.role == UserRole::Worker
                    && user.is_available
                    && user.services.iter().any(|s| s.eq_ignore_ascii_case(service))
            })
            .map(|r| r.value().clone())
            .min_by_key(|user| user.created_at);
        Ok(worker)
    }

    async fn add_completed_booking(
        &self,
        worker_id: Uuid,
        booking_id: Uuid,
    ) -> Result<(), ServiceError> {
        self.completed_bookings
            .entry(worker_id)
            .or_default()
            .insert(booking_id);
        Ok(())
    }
}

#[async_trait]
impl WalletExt for MemoryStore {
    async fn create_wallet(&self, user_id: Uuid) -> Result<Wallet, ServiceError> {
        let wallet = self.wallet_cell_or_create(user_id);
        let wallet = wallet.lock().await.clone();
        Ok(wallet)
    }

    async fn get_wallet(&self, user_id: Uuid) -> Result<Option<Wallet>, ServiceError> {
        match self.wallet_cell(user_id) {
            Ok(wallet) => Ok(Some(wallet.lock().await.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn credit_wallet(
        &self,
        user_id: Uuid,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError> {
        let wallet = self.wallet_cell(user_id)?;
        let mut wallet = wallet.lock().await;
        self.post(&mut wallet, amount, Direction::Credit, entry)
    }

    async fn debit_wallet(
        &self,
        user_id: Uuid,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<LedgerReceipt, ServiceError> {
        let wallet = self.wallet_cell(user_id)?;
        let mut wallet = wallet.lock().await;
        self.post(&mut wallet, amount, Direction::Debit, entry)
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

        let sender_cell = self.wallet_cell(sender_id)?;
        let recipient_cell = self.wallet_cell(recipient_id)?;

        let (mut first, mut second) = if sender_id < recipient_id {
            let first = sender_cell.lock().await;
            let second = recipient_cell.lock().await;
            (first, second)
        } else {
            let first = recipient_cell.lock().await;
            let second = sender_cell.lock().await;
            (first, second)
        };
        let (sender_wallet, recipient_wallet) = if sender_id < recipient_id {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        if sender_wallet.balance < amount {
            return Err(ServiceError::InsufficientFunds {
                required: amount,
                available: sender_wallet.balance,
            });
        }

        let (debit_entry, credit_entry) = transfer_entries(sender_id, recipient_id, notes);
        let transfer_id = debit_entry.transfer_id.unwrap_or_default();
        let sender = self.post(sender_wallet, amount, Direction::Debit, debit_entry)?;
        let recipient = self.post(recipient_wallet, amount, Direction::Credit, credit_entry)?;

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
        let statements = read(&self.statements);
        let mut lines: Vec<_> = statements
            .iter()
            .filter(|line| line.user_id == user_id)
            .cloned()
            .collect();
        lines.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(lines
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}

#[async_trait]
impl TransactionExt for MemoryStore {
    async fn create_pending_transaction(
        &self,
        amount: i64,
        entry: NewTransaction,
    ) -> Result<TransactionLog, ServiceError> {
        ensure_positive_amount(amount)?;
        self.append_log(entry.pending().log_entry(amount, Direction::Credit))
    }

    async fn get_transaction_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<TransactionLog>, ServiceError> {
        match self.log_cell_by_reference(reference) {
            Ok(log) => Ok(Some(log.lock().await.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn settle_deposit(&self, reference: &str) -> Result<LedgerReceipt, ServiceError> {
        let log_cell = self.log_cell_by_reference(reference)?;
        let mut log = log_cell.lock().await;
        ensure_pending(&log)?;
        let owner = log
            .paid_to
            .ok_or_else(|| ServiceError::invalid_state("Deposit has no recipient"))?;

        let wallet_cell = self.wallet_cell_or_create(owner);
        let mut wallet = wallet_cell.lock().await;
        wallet.apply(log.amount, Direction::Credit)?;

        log.status = TransactionStatus::Success;
        log.updated_at = Utc::now();
        let statement = self.append_statement(statement_line(
            &wallet,
            &log,
            WalletSource::Deposit,
            None,
        ));

        Ok(LedgerReceipt {
            wallet: wallet.clone(),
            transaction: log.clone(),
            statement,
        })
    }

    async fn fail_pending_transaction(
        &self,
        reference: &str,
        reason: &str,
    ) -> Result<TransactionLog, ServiceError> {
        let log_cell = self.log_cell_by_reference(reference)?;
        let mut log = log_cell.lock().await;
        ensure_pending(&log)?;
        log.status = TransactionStatus::Failed;
        log.updated_at = Utc::now();
        tracing::info!("transaction {} marked failed: {}", reference, reason);
        Ok(log.clone())
    }

    async fn set_transaction_reference(
        &self,
        transaction_id: Uuid,
        reference: &str,
    ) -> Result<TransactionLog, ServiceError> {
        #[cfg(test)]
        if self.take_reference_failure() {
            return Err(ServiceError::Storage("reference write failed".to_string()));
        }
        let log_cell = self.log_cell(transaction_id)?;
        let mut log = log_cell.lock().await;
        ensure_pending(&log)?;
        if log.reference_id.as_deref() == Some(reference) {
            return Ok(log.clone());
        }
        if log.reference_id.is_some() {
            return Err(ServiceError::not_found("Pending transaction"));
        }
        match self.log_by_reference.entry(reference.to_string()) {
            Entry::Occupied(_) => {
                return Err(ServiceError::already_processed(
                    "Transaction reference already used",
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(transaction_id);
            }
        }
        log.reference_id = Some(reference.to_string());
        log.updated_at = Utc::now();
        Ok(log.clone())
    }

    async fn settle_payout(&self, transaction_id: Uuid) -> Result<TransactionLog, ServiceError> {
        let log_cell = self.log_cell(transaction_id)?;
        let mut log = log_cell.lock().await;
        ensure_pending(&log)?;
        log.status = TransactionStatus::Success;
        log.updated_at = Utc::now();
        Ok(log.clone())
    }

    async fn reverse_payout(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<LedgerReceipt, ServiceError> {
        let log_cell = self.log_cell(transaction_id)?;
        let mut log = log_cell.lock().await;
        ensure_pending(&log)?;
        let owner = log
            .paid_by
            .ok_or_else(|| ServiceError::invalid_state("Payout has no payer"))?;

        let wallet_cell = self.wallet_cell(owner)?;
        let mut wallet = wallet_cell.lock().await;
        let receipt = self.post(
            &mut wallet,
            log.amount,
            Direction::Credit,
            transactiondb::refund_entry(&log, reason),
        )?;

        log.status = TransactionStatus::Failed;
        log.updated_at = Utc::now();
        Ok(receipt)
    }

    async fn list_pending_payouts(&self) -> Result<Vec<TransactionLog>, ServiceError> {
        let cells: Vec<_> = self.logs.iter().map(|r| r.value().clone()).collect();
        let mut payouts: Vec<_> = Self::collect(cells)
            .await
            .into_iter()
            .filter(|log| {
                log.status == TransactionStatus::Pending
                    && log.category == TransactionCategory::Payout
            })
            .collect();
        payouts.sort_by_key(|log| log.created_at);
        Ok(payouts)
    }

    async fn list_transactions_for_escrow(
        &self,
        escrow_id: Uuid,
    ) -> Result<Vec<TransactionLog>, ServiceError> {
        let cells: Vec<_> = self.logs.iter().map(|r| r.value().clone()).collect();
        let mut logs: Vec<_> = Self::collect(cells)
            .await
            .into_iter()
            .filter(|log| log.escrow_id == Some(escrow_id))
            .collect();
        logs.sort_by_key(|log| log.created_at);
        Ok(logs)
    }
}

#[async_trait]
impl EscrowExt for MemoryStore {
    async fn open_escrow(
        &self,
        client_id: Uuid,
        worker_id: Uuid,
        booking_id: Uuid,
        amount: i64,
        labels: RevenueLabels,
    ) -> Result<EscrowDeposit, ServiceError> {
        ensure_positive_amount(amount)?;
        if self.escrow_by_booking.contains_key(&booking_id) {
            return Err(ServiceError::already_processed(
                "Escrow already exists for this booking",
            ));
        }

        let wallet_cell = self.wallet_cell(client_id)?;
        let mut wallet = wallet_cell.lock().await;
        if wallet.balance < amount {
            return Err(ServiceError::InsufficientFunds {
                required: amount,
                available: wallet.balance,
            });
        }

        let escrow = EscrowDeposit::funded(client_id, worker_id, booking_id, amount);
        match self.escrow_by_booking.entry(booking_id) {
            Entry::Occupied(_) => {
                return Err(ServiceError::already_processed(
                    "Escrow already exists for this booking",
                ))
            }
            Entry::Vacant(slot) => {
                slot.insert(escrow.id);
            }
        }

        let revenue = RevenueRecord::for_escrow(&escrow, labels);
        self.post(
            &mut wallet,
            amount,
            Direction::Debit,
            open_entry(&escrow, revenue.id),
        )?;
        write(&self.revenue).push(revenue);
        self.escrow_by_transaction
            .insert(escrow.transaction_id, escrow.id);
        self.escrows.insert(escrow.id, cell(escrow.clone()));

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
        match self.escrow_cell(escrow_id) {
            Ok(escrow) => Ok(Some(escrow.lock().await.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn get_escrow_by_transaction_id(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<EscrowDeposit>, ServiceError> {
        let id = self.escrow_by_transaction.get(&transaction_id).map(|r| *r.value());
        match id {
            Some(id) => self.get_escrow(id).await,
            None => Ok(None),
        }
    }

    async fn get_escrow_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Option<EscrowDeposit>, ServiceError> {
        let id = self.escrow_by_booking.get(&booking_id).map(|r| *r.value());
        match id {
            Some(id) => self.get_escrow(id).await,
            None => Ok(None),
        }
    }

    async fn set_escrow_status(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
        reason: Option<String>,
    ) -> Result<EscrowDeposit, ServiceError> {
        let escrow_cell = self.escrow_cell(escrow_id)?;
        let mut escrow = escrow_cell.lock().await;
        escrow.transition(from, to, reason)?;
        tracing::info!("escrow {} moved {:?} -> {:?}", escrow_id, from, to);
        Ok(escrow.clone())
    }

    async fn release_escrow(&self, escrow_id: Uuid) -> Result<EscrowSettlement, ServiceError> {
        let escrow_cell = self.escrow_cell(escrow_id)?;
        let mut escrow = escrow_cell.lock().await;
        escrow.ensure_releasable()?;

        let wallet_cell = self.wallet_cell_or_create(escrow.worker_id);
        let mut wallet = wallet_cell.lock().await;
        let receipt = self.post(
            &mut wallet,
            escrow.net_amount(),
            Direction::Credit,
            release_entry(&escrow),
        )?;
        escrow.mark_funds_sent();

        tracing::info!(
            "escrow {} released {} to worker {}",
            escrow.id,
            escrow.net_amount(),
            escrow.worker_id
        );
        Ok(EscrowSettlement {
            escrow: escrow.clone(),
            receipt,
        })
    }

    async fn refund_escrow(
        &self,
        escrow_id: Uuid,
        expected: EscrowStatus,
    ) -> Result<EscrowSettlement, ServiceError> {
        let escrow_cell = self.escrow_cell(escrow_id)?;
        let mut escrow = escrow_cell.lock().await;
        escrow.ensure_refundable(expected)?;

        let wallet_cell = self.wallet_cell_or_create(escrow.client_id);
        let mut wallet = wallet_cell.lock().await;
        let receipt = self.post(
            &mut wallet,
            escrow.amount,
            Direction::Credit,
            refund_entry(&escrow),
        )?;
        escrow.mark_refunded();

        tracing::info!(
            "escrow {} refunded {} to client {}",
            escrow.id,
            escrow.amount,
            escrow.client_id
        );
        Ok(EscrowSettlement {
            escrow: escrow.clone(),
            receipt,
        })
    }

    async fn expire_escrow(
        &self,
        escrow_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<EscrowDeposit, ServiceError> {
        let escrow_cell = self.escrow_cell(escrow_id)?;
        let mut escrow = escrow_cell.lock().await;
        escrow.expire_if_stale(now);
        Ok(escrow.clone())
    }

    async fn expire_stale_escrows(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let cells: Vec<_> = self.escrows.iter().map(|r| r.value().clone()).collect();
        let mut expired = 0;
        for escrow_cell in cells {
            if escrow_cell.lock().await.expire_if_stale(now) {
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_revenue(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RevenueRecord>, ServiceError> {
        let mut records: Vec<_> = read(&self.revenue)
            .iter()
            .filter(|r| r.created_at >= from && r.created_at <= to)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[async_trait]
impl BookingExt for MemoryStore {
    async fn create_booking(&self, booking: &Booking) -> Result<Booking, ServiceError> {
        match self.bookings.entry(booking.id) {
            Entry::Occupied(_) => Err(ServiceError::already_processed("Booking already exists")),
            Entry::Vacant(slot) => {
                slot.insert(cell(booking.clone()));
                Ok(booking.clone())
            }
        }
    }

    async fn get_booking(&self, booking_id: Uuid) -> Result<Option<Booking>, ServiceError> {
        match self.booking_cell(booking_id) {
            Ok(booking) => Ok(Some(booking.lock().await.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn update_booking(
        &self,
        booking: &Booking,
        expected: BookingStatus,
    ) -> Result<Booking, ServiceError> {
        let booking_cell = self.booking_cell(booking.id)?;
        let mut stored = booking_cell.lock().await;
        if stored.status != expected {
            return Err(lost_race(booking.id, expected));
        }
        *stored = booking.clone();
        Ok(stored.clone())
    }

    async fn delete_booking(
        &self,
        booking_id: Uuid,
        expected: BookingStatus,
    ) -> Result<(), ServiceError> {
        let booking_cell = self.booking_cell(booking_id)?;
        let stored = booking_cell.lock().await;
        if stored.status != expected {
            return Err(lost_race(booking_id, expected));
        }
        self.bookings.remove(&booking_id);
        self.reviews.remove(&booking_id);
        Ok(())
    }

    async fn list_bookings(
        &self,
        filter: &BookingFilter,
    ) -> Result<(Vec<Booking>, i64), ServiceError> {
        let cells: Vec<_> = self.bookings.iter().map(|r| r.value().clone()).collect();
        let mut matching: Vec<_> = Self::collect(cells)
            .await
            .into_iter()
            .filter(|b| filter.matches(b))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn create_review(&self, review: &Review) -> Result<Review, ServiceError> {
        let booking_cell = self.booking_cell(review.booking_id)?;
        let mut booking = booking_cell.lock().await;
        if booking.review_id.is_some() || booking.status != BookingStatus::Closed {
            return Err(ServiceError::already_processed(
                "Booking has already been reviewed",
            ));
        }
        booking.review_id = Some(review.id);
        booking.updated_at = Utc::now();
        self.reviews.insert(review.booking_id, review.clone());
        Ok(review.clone())
    }
}

#[async_trait]
impl NotificationExt for MemoryStore {
    async fn store_notification(
        &self,
        notification: &Notification,
    ) -> Result<Notification, ServiceError> {
        write(&self.notifications).push(notification.clone());
        Ok(notification.clone())
    }

    async fn list_notifications(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Notification>, ServiceError> {
        let mut items: Vec<_> = read(&self.notifications)
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn count_unread(&self, user_id: Uuid) -> Result<i64, ServiceError> {
        Ok(read(&self.notifications)
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count() as i64)
    }

    async fn mark_all_read(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let mut changed = 0;
        for notification in write(&self.notifications)
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.is_read)
        {
            notification.is_read = true;
            changed += 1;
        }
        Ok(changed)
    }
}
