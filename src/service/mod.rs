pub mod background_jobs;
pub mod error;
pub mod escrow_service;
pub mod notification_service;
pub mod payment_provider;
pub mod payment_service;
pub mod settlement_service;
pub mod wallet_service;
