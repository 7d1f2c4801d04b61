// handler/revenue.rs
use std::sync::Arc;

use axum::{
    extract::Query, middleware, response::IntoResponse, routing::get, Extension, Json, Router,
};

use crate::{
    dtos::{transactiondtos::*, ApiResponse},
    error::HttpError,
    middleware::role_check,
    models::usermodel::UserRole,
    AppState,
};

pub fn revenue_handler() -> Router {
    Router::new()
        .route("/range", get(get_revenue_range))
        .layer(middleware::from_fn(|state, req, next| {
            role_check(state, req, next, vec![UserRole::Admin])
        }))
}

pub async fn get_revenue_range(
    Extension(app_state): Extension<Arc<AppState>>,
    Query(query): Query<RevenueRangeQueryDto>,
) -> Result<impl IntoResponse, HttpError> {
    let records = app_state
        .escrow_service
        .revenue_between(query.from, query.to)
        .await?;

    let summary = RevenueSummaryDto {
        total_amount: records.iter().map(|r| r.amount).sum(),
        total_revenue: records.iter().map(|r| r.revenue).sum(),
        count: records.len(),
        records,
    };

    Ok(Json(ApiResponse::success(
        "Revenue retrieved successfully",
        summary,
    )))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use chrono::{Duration, SecondsFormat, Utc};

    use crate::db::{EscrowExt, WalletExt};
    use crate::handler::test_support::{app, send, user};
    use crate::models::escrowmodels::RevenueLabels;
    use crate::models::usermodel::UserRole;

    #[tokio::test]
    async fn admins_see_revenue_totals() {
        let app = app();
        let admin = user(&app.store, UserRole::Admin, "Admin", &[]);
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let worker = user(&app.store, UserRole::Worker, "Otieno", &[]);

        app.store.create_wallet(client.id).await.unwrap();
        app.state
            .wallet_service
            .admin_topup(&admin, client.id, 2000, None)
            .await
            .unwrap();
        for amount in [1000, 800] {
            app.store
                .open_escrow(client.id, worker.id, uuid::Uuid::new_v4(), amount, RevenueLabels::default())
                .await
                .unwrap();
        }

        let from = (Utc::now() - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let to = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
        let uri = format!("/api/revenue/range?from={}&to={}", from, to);

        let (status, _) = send(&app.router, Method::GET, &uri, Some(&client), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&app.router, Method::GET, &uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["count"], 2);
        assert_eq!(body["data"]["total_amount"], 1800);
        assert_eq!(body["data"]["total_revenue"], 360);

        let reversed = format!("/api/revenue/range?from={}&to={}", to, from);
        let (status, body) = send(&app.router, Method::GET, &reversed, Some(&admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "ValidationError");
    }
}
