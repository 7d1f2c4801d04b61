mod config;
mod db;
mod dtos;
mod error;
mod handler;
mod middleware;
mod models;
mod routes;
mod service;
mod utils;

use std::sync::Arc;

use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use config::Config;
use dotenv::dotenv;
use routes::create_router;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::filter::LevelFilter;

use crate::db::{db::DBClient, memory::MemoryStore, Store};
use service::{
    escrow_service::EscrowService,
    notification_service::{ConnectionRegistry, NotificationDispatcher, RealtimeSink},
    payment_provider::{MobileMoneyGateway, MpesaClient, PayPalClient, PayoutGateway},
    payment_service::PaymentService,
    settlement_service::SettlementService,
    wallet_service::WalletService,
};

#[derive(Debug, Clone)]
pub struct AppState {
    pub env: Config,
    pub store: Arc<dyn Store>,
    pub registry: Arc<ConnectionRegistry>,
    pub notifications: NotificationDispatcher,
    // Services
    pub wallet_service: Arc<WalletService>,
    pub escrow_service: Arc<EscrowService>,
    pub settlement_service: Arc<SettlementService>,
    pub payment_service: Arc<PaymentService>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        mobile_money: Arc<dyn MobileMoneyGateway>,
        payouts: Arc<dyn PayoutGateway>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let notifications = NotificationDispatcher::start(
            store.clone(),
            vec![Arc::new(RealtimeSink::new(registry.clone()))],
        );

        let wallet_service = Arc::new(WalletService::new(store.clone()));
        let escrow_service = EscrowService::new(store.clone());
        let settlement_service = Arc::new(SettlementService::new(
            store.clone(),
            escrow_service.clone(),
            notifications.clone(),
        ));
        let payment_service = Arc::new(PaymentService::new(
            store.clone(),
            mobile_money,
            payouts,
            notifications.clone(),
        ));

        Self {
            env: config,
            store,
            registry,
            notifications,
            wallet_service,
            escrow_service: Arc::new(escrow_service),
            settlement_service,
            payment_service,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::DEBUG)
        .init();

    dotenv().ok();

    let config = match Config::init() {
        Ok(config) => config,
        Err(err) => {
            println!("🔥 Invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            let pool = match PgPoolOptions::new()
                .max_connections(20)
                .min_connections(5)
                .connect(database_url)
                .await
            {
                Ok(pool) => {
                    println!("✅ Connection to the database is successful!");
                    pool
                }
                Err(err) => {
                    println!("🔥 Failed to connect to the database: {:?}", err);
                    std::process::exit(1);
                }
            };

            if let Err(err) = sqlx::migrate!("./migrations").run(&pool).await {
                println!("🔥 Failed to run migrations: {:?}", err);
                std::process::exit(1);
            }

            Arc::new(DBClient::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set, running on the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid origin {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_headers([AUTHORIZATION, ACCEPT, CONTENT_TYPE])
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::PATCH]);

    let mobile_money = Arc::new(MpesaClient::new(config.mpesa.clone()));
    let payouts = Arc::new(PayPalClient::new(config.paypal.clone()));
    let app_state = Arc::new(AppState::new(config.clone(), store, mobile_money, payouts));

    let app = create_router(app_state.clone()).layer(cors);

    // Start background jobs
    tokio::spawn(service::background_jobs::start_escrow_expiry_job(app_state.clone()));
    tokio::spawn(service::background_jobs::start_payout_status_job(app_state.clone()));

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", &config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            println!("🔥 Failed to bind port {}: {}", config.port, err);
            std::process::exit(1);
        }
    };

    println!("🚀 Server is running on http://localhost:{}", config.port);

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("server error: {}", err);
    }
}
