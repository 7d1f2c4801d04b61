// handler/transactions.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{transactiondtos::*, ApiResponse, RequestQueryDto},
    error::HttpError,
    middleware::{role_check, JWTAuthMiddeware},
    models::usermodel::UserRole,
    AppState,
};

pub fn transactions_handler() -> Router {
    let admin_routes = Router::new()
        .route("/wallet/topup", post(admin_topup))
        .route("/escrow/release", post(release_escrow))
        .route("/escrow/refund", post(refund_escrow))
        .route("/escrow/admin-release", post(admin_release_escrow))
        .layer(middleware::from_fn(|state, req, next| {
            role_check(state, req, next, vec![UserRole::Admin])
        }));

    Router::new()
        .route("/wallet", get(get_wallet).post(create_wallet))
        .route("/wallet/statement", get(get_statement))
        .route("/wallet/transfer", post(transfer_funds))
        .route("/deposit/request", post(request_deposit))
        .route("/withdraw", post(withdraw_funds))
        .route("/escrow/:escrow_id", get(get_escrow))
        .merge(admin_routes)
}

pub async fn create_wallet(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
) -> Result<impl IntoResponse, HttpError> {
    let wallet = app_state.wallet_service.create_wallet(&auth.principal).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Wallet ready", wallet)),
    ))
}

pub async fn get_wallet(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
) -> Result<impl IntoResponse, HttpError> {
    let wallet = app_state.wallet_service.balance(&auth.principal).await?;

    Ok(Json(ApiResponse::success(
        "Wallet retrieved successfully",
        wallet,
    )))
}

pub async fn get_statement(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Query(query): Query<RequestQueryDto>,
) -> Result<impl IntoResponse, HttpError> {
    query
        .validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let statement = app_state
        .wallet_service
        .statement(&auth.principal, query.page(), query.limit())
        .await?;

    Ok(Json(ApiResponse::success(
        "Statement retrieved successfully",
        statement,
    )))
}

pub async fn transfer_funds(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<TransferDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let receipt = app_state
        .wallet_service
        .transfer(&auth.principal, body.recipient_id, body.amount, body.notes)
        .await?;

    Ok(Json(ApiResponse::success("Transfer completed", receipt)))
}

pub async fn admin_topup(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<AdminTopupDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let receipt = app_state
        .wallet_service
        .admin_topup(&auth.principal, body.user_id, body.amount, body.notes)
        .await?;

    Ok(Json(ApiResponse::success("Wallet topped up", receipt)))
}

pub async fn request_deposit(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<DepositRequestDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let pending = app_state
        .payment_service
        .request_deposit(&auth.principal, &body.phone_number, body.amount)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(
            "Deposit initiated, confirm the prompt on your phone",
            pending,
        )),
    ))
}

pub async fn withdraw_funds(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<WithdrawDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let payout = app_state
        .payment_service
        .withdraw(&auth.principal, &body.destination, body.amount)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success("Withdrawal submitted", payout)),
    ))
}

pub async fn get_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let escrow = app_state.escrow_service.get(escrow_id).await?;

    let principal = auth.principal;
    if !principal.is_admin() && escrow.client_id != principal.id && escrow.worker_id != principal.id {
        return Err(HttpError::forbidden("You are not part of this escrow").with_kind("Forbidden"));
    }

    Ok(Json(ApiResponse::success(
        "Escrow retrieved successfully",
        escrow,
    )))
}

pub async fn release_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<EscrowIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state.escrow_service.release(body.escrow_id).await?;

    Ok(Json(ApiResponse::success(
        "Funds released to worker",
        settlement,
    )))
}

pub async fn refund_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<EscrowIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state.escrow_service.refund(body.escrow_id).await?;

    Ok(Json(ApiResponse::success(
        "Funds refunded to client",
        settlement,
    )))
}

pub async fn admin_release_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<EscrowIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let escrow = app_state.escrow_service.mark_released(body.escrow_id).await?;

    Ok(Json(ApiResponse::success(
        "Escrow approved for release",
        escrow,
    )))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::db::{EscrowExt, WalletExt};
    use crate::handler::test_support::{app, send, user};
    use crate::models::escrowmodels::RevenueLabels;
    use crate::models::usermodel::UserRole;

    #[tokio::test]
    async fn topup_then_transfer() {
        let app = app();
        let admin = user(&app.store, UserRole::Admin, "Admin", &[]);
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let worker = user(&app.store, UserRole::Worker, "Otieno", &[]);

        for principal in [&client, &worker] {
            let (status, _) =
                send(&app.router, Method::POST, "/api/transactions/wallet", Some(principal), None).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/wallet/topup",
            Some(&client),
            Some(json!({ "user_id": client.id, "amount": 500 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["kind"], "Forbidden");

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/wallet/topup",
            Some(&admin),
            Some(json!({ "user_id": client.id, "amount": 500 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["wallet"]["balance"], 500);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/wallet/transfer",
            Some(&client),
            Some(json!({ "recipient_id": worker.id, "amount": 900 })),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["kind"], "InsufficientFunds");

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/wallet/transfer",
            Some(&client),
            Some(json!({ "recipient_id": worker.id, "amount": 200, "notes": "tip" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (status, body) = send(&app.router, Method::GET, "/api/transactions/wallet", Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["balance"], 300);

        let (status, body) = send(
            &app.router,
            Method::GET,
            "/api/transactions/wallet/statement?page=1&limit=10",
            Some(&client),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn escrow_is_visible_to_its_parties_only() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let worker = user(&app.store, UserRole::Worker, "Otieno", &[]);
        let stranger = user(&app.store, UserRole::Client, "Baraka", &[]);
        let admin = user(&app.store, UserRole::Admin, "Admin", &[]);

        app.store.create_wallet(client.id).await.unwrap();
        app.state
            .wallet_service
            .admin_topup(&admin, client.id, 1000, None)
            .await
            .unwrap();
        let escrow = app
            .store
            .open_escrow(client.id, worker.id, uuid::Uuid::new_v4(), 1000, RevenueLabels::default())
            .await
            .unwrap();
        let uri = format!("/api/transactions/escrow/{}", escrow.id);

        let (status, body) = send(&app.router, Method::GET, &uri, Some(&worker), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["revenue"], 200);

        let (status, _) = send(&app.router, Method::GET, &uri, Some(&stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // release needs admin approval first
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/escrow/release",
            Some(&admin),
            Some(json!({ "escrow_id": escrow.id })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "InvalidState");

        let (status, _) = send(
            &app.router,
            Method::POST,
            "/api/transactions/escrow/admin-release",
            Some(&admin),
            Some(json!({ "escrow_id": escrow.id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/escrow/release",
            Some(&admin),
            Some(json!({ "escrow_id": escrow.id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["escrow"]["funds_sent"], true);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/escrow/refund",
            Some(&admin),
            Some(json!({ "escrow_id": escrow.id })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "InvalidState");
        assert_eq!(app.store.get_wallet(client.id).await.unwrap().unwrap().balance, 0);
        assert_eq!(app.store.get_wallet(worker.id).await.unwrap().unwrap().balance, 800);
    }

    #[tokio::test]
    async fn deposit_request_records_pending_entry() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/deposit/request",
            Some(&client),
            Some(json!({ "phone_number": "0712345678", "amount": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/deposit/request",
            Some(&client),
            Some(json!({ "phone_number": "0712345678", "amount": 250 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        assert_eq!(body["data"]["status"], "pending");
        assert!(body["data"]["reference_id"].is_string());
    }
}
