// handler/booking.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::{bookingdtos::*, ApiResponse, PaginatedResponse, PaginationMetadata},
    error::HttpError,
    middleware::{role_check, JWTAuthMiddeware},
    models::usermodel::UserRole,
    AppState,
};

pub fn booking_handler() -> Router {
    Router::new()
        .route(
            "/",
            get(list_bookings).layer(middleware::from_fn(|state, req, next| {
                role_check(state, req, next, vec![UserRole::Admin])
            })),
        )
        .route(
            "/create",
            post(create_booking).layer(middleware::from_fn(|state, req, next| {
                role_check(state, req, next, vec![UserRole::Client])
            })),
        )
        .route("/confirm-budget", post(confirm_budget))
        .route("/start", post(start_booking))
        .route("/complete", post(complete_booking))
        .route("/close", post(close_booking))
        .route("/cancel", post(cancel_booking))
        .route("/delete", delete(delete_booking))
        .route("/dispute", post(raise_dispute))
        .route(
            "/resolve-dispute",
            post(resolve_dispute).layer(middleware::from_fn(|state, req, next| {
                role_check(state, req, next, vec![UserRole::Admin])
            })),
        )
        .route("/:booking_id", get(get_booking))
        .route("/:booking_id/review", post(submit_review))
}

pub async fn create_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<CreateBookingDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let booking = app_state
        .settlement_service
        .create_booking(&auth.principal, body.into())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(
            "Booking created successfully",
            FilterBookingDto::filter_booking(&booking),
        )),
    ))
}

pub async fn confirm_budget(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<ConfirmBudgetDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let outcome = app_state
        .settlement_service
        .confirm_budget(&auth.principal, body.booking_id, body.amount)
        .await?;
    let response = ConfirmBudgetResponseDto::from(outcome);

    let message = if response.shortfall > 0 {
        "Budget confirmed, waiting for the client to top up"
    } else {
        "Budget confirmed and funds held in escrow"
    };
    Ok(Json(ApiResponse::success(message, response)))
}

pub async fn start_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<BookingIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state
        .settlement_service
        .start(&auth.principal, body.booking_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Booking started",
        BookingSettlementDto::from(settlement),
    )))
}

pub async fn complete_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<BookingIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state
        .settlement_service
        .mark_complete(&auth.principal, body.booking_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Booking marked as complete",
        BookingSettlementDto::from(settlement),
    )))
}

pub async fn close_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<BookingIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state
        .settlement_service
        .close(&auth.principal, body.booking_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Booking closed and payment released",
        BookingSettlementDto::from(settlement),
    )))
}

pub async fn cancel_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<BookingIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state
        .settlement_service
        .cancel(&auth.principal, body.booking_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Booking cancelled",
        BookingSettlementDto::from(settlement),
    )))
}

pub async fn delete_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<BookingIdDto>,
) -> Result<impl IntoResponse, HttpError> {
    app_state
        .settlement_service
        .delete(&auth.principal, body.booking_id)
        .await?;

    Ok(Json(ApiResponse::success("Booking deleted", body.booking_id)))
}

pub async fn raise_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<RaiseDisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let settlement = app_state
        .settlement_service
        .raise_dispute(&auth.principal, body.booking_id, body.reason, body.details)
        .await?;

    Ok(Json(ApiResponse::success(
        "Dispute raised",
        BookingSettlementDto::from(settlement),
    )))
}

pub async fn resolve_dispute(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Json(body): Json<ResolveDisputeDto>,
) -> Result<impl IntoResponse, HttpError> {
    let settlement = app_state
        .settlement_service
        .resolve_dispute(&auth.principal, body.booking_id, body.resolution)
        .await?;

    Ok(Json(ApiResponse::success(
        "Dispute resolved",
        BookingSettlementDto::from(settlement),
    )))
}

pub async fn submit_review(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(booking_id): Path<Uuid>,
    Json(body): Json<ReviewDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let review = app_state
        .settlement_service
        .submit_review(&auth.principal, booking_id, body.rating, body.review, body.images)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Review submitted", review)),
    ))
}

pub async fn get_booking(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Path(booking_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let booking = app_state
        .settlement_service
        .get(&auth.principal, booking_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Booking retrieved successfully",
        FilterBookingDto::filter_booking(&booking),
    )))
}

pub async fn list_bookings(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Query(query): Query<BookingQueryDto>,
) -> Result<impl IntoResponse, HttpError> {
    query
        .validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let (bookings, total) = app_state
        .settlement_service
        .list(&auth.principal, &query.to_filter())
        .await?;

    Ok(Json(PaginatedResponse::new(
        FilterBookingDto::filter_bookings(&bookings),
        PaginationMetadata::new(total, query.page(), query.limit()),
    )))
}
