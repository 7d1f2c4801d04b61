use std::sync::Arc;

use axum::{middleware, routing::get, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        booking::booking_handler, mpesa::mpesa_handler, notifications::notifications_handler,
        realtime::realtime_handler, revenue::revenue_handler,
        transactions::transactions_handler,
    },
    middleware::auth,
    AppState,
};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running"
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_route = Router::new()
        .nest("/bookings", booking_handler().layer(middleware::from_fn(auth)))
        .nest(
            "/transactions",
            transactions_handler().layer(middleware::from_fn(auth)),
        )
        .nest(
            "/notifications",
            notifications_handler().layer(middleware::from_fn(auth)),
        )
        .nest("/revenue", revenue_handler().layer(middleware::from_fn(auth)))
        // the gateway posts here unauthenticated
        .nest("/mpesa", mpesa_handler())
        .layer(TraceLayer::new_for_http());

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
        .nest("/ws", realtime_handler().layer(middleware::from_fn(auth)))
        .layer(Extension(app_state))
}
