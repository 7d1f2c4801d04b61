// service/wallet_service.rs
use std::sync::Arc;

use uuid::Uuid;

use crate::{
    db::{Store, WalletExt},
    models::{
        usermodel::Principal,
        walletmodels::*,
    },
    service::error::ServiceError,
};

#[derive(Debug, Clone)]
pub struct WalletService {
    store: Arc<dyn Store>,
}

impl WalletService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Idempotent: returns the existing wallet when there is one.
    pub async fn create_wallet(&self, principal: &Principal) -> Result<Wallet, ServiceError> {
        self.store.create_wallet(principal.id).await
    }

    pub async fn balance(&self, principal: &Principal) -> Result<Wallet, ServiceError> {
        self.store
            .get_wallet(principal.id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Wallet"))
    }

    pub async fn statement(
        &self,
        principal: &Principal,
        page: u32,
        limit: usize,
    ) -> Result<Vec<WalletTransaction>, ServiceError> {
        let limit = limit.clamp(1, 100) as i64;
        let offset = (page.max(1) as i64 - 1) * limit;
        self.store
            .get_wallet_transactions(principal.id, limit, offset)
            .await
    }

    pub async fn transfer(
        &self,
        principal: &Principal,
        recipient_id: Uuid,
        amount: i64,
        notes: Option<String>,
    ) -> Result<TransferReceipt, ServiceError> {
        ensure_positive_amount(amount)?;
        let receipt = self
            .store
            .transfer_funds(principal.id, recipient_id, amount, notes)
            .await?;

        tracing::info!(
            "transfer {} moved {} from {} to {}",
            receipt.transfer_id,
            amount,
            principal.id,
            recipient_id
        );
        Ok(receipt)
    }

    /// Admin credit to any user's wallet, creating it if needed.
    pub async fn admin_topup(
        &self,
        principal: &Principal,
        user_id: Uuid,
        amount: i64,
        notes: Option<String>,
    ) -> Result<LedgerReceipt, ServiceError> {
        if !principal.is_admin() {
            return Err(ServiceError::forbidden("Only admins can top up wallets"));
        }
        ensure_positive_amount(amount)?;

        self.store.create_wallet(user_id).await?;
        let entry = NewTransaction::new(TransactionCategory::AdminTopup, WalletSource::Revenue)
            .paid_by(principal.id)
            .paid_to(user_id)
            .notes(notes.unwrap_or_else(|| "Admin top-up".to_string()));
        let receipt = self.store.credit_wallet(user_id, amount, entry).await?;

        tracing::info!("admin {} topped up {} by {}", principal.id, user_id, amount);
        Ok(receipt)
    }
}
