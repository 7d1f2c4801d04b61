// handler/mpesa.rs
use std::sync::Arc;

use axum::{response::IntoResponse, routing::post, Extension, Json, Router};
use serde_json::json;

use crate::{
    dtos::transactiondtos::MpesaCallbackDto,
    error::HttpError,
    service::payment_service::{CallbackOutcome, DepositCallback},
    AppState,
};

pub fn mpesa_handler() -> Router {
    Router::new().route("/callback", post(mpesa_callback))
}

/// STK push result from the gateway. Public: the reference is the only link
/// back to the pending deposit.
pub async fn mpesa_callback(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<MpesaCallbackDto>,
) -> Result<impl IntoResponse, HttpError> {
    let callback = DepositCallback::from(body);
    tracing::info!(
        "M-Pesa callback for {} with result {}",
        callback.reference,
        callback.result_code
    );

    let outcome = app_state
        .payment_service
        .handle_deposit_callback(callback)
        .await?;

    let description = match outcome {
        CallbackOutcome::Credited { .. } => "Accepted",
        CallbackOutcome::Failed { .. } => "Recorded failure",
    };
    Ok(Json(json!({
        "ResultCode": 0,
        "ResultDesc": description,
    })))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::{json, Value};

    use crate::db::WalletExt;
    use crate::handler::test_support::{app, send, user};
    use crate::models::usermodel::UserRole;

    fn callback(reference: &str, code: i64) -> Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": reference,
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": code,
                    "ResultDesc": if code == 0 { "Success" } else { "Request cancelled by user" },
                    "CallbackMetadata": {
                        "Item": [
                            { "Name": "Amount", "Value": 300 },
                            { "Name": "PhoneNumber", "Value": 254712345678u64 }
                        ]
                    }
                }
            }
        })
    }

    async fn pending_reference(app: &crate::handler::test_support::TestApp, client: &crate::models::usermodel::Principal) -> String {
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/transactions/deposit/request",
            Some(client),
            Some(json!({ "phone_number": "0712345678", "amount": 300 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED, "{body}");
        body["data"]["reference_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn successful_callback_credits_the_depositor() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let reference = pending_reference(&app, &client).await;

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/mpesa/callback",
            None,
            Some(callback(&reference, 0)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["ResultCode"], 0);
        assert_eq!(app.store.get_wallet(client.id).await.unwrap().unwrap().balance, 300);

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/mpesa/callback",
            None,
            Some(callback(&reference, 0)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "NotFound");
        assert_eq!(app.store.get_wallet(client.id).await.unwrap().unwrap().balance, 300);
    }

    #[tokio::test]
    async fn cancelled_callback_moves_no_money() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let reference = pending_reference(&app, &client).await;

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/api/mpesa/callback",
            None,
            Some(callback(&reference, 1032)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["ResultDesc"], "Recorded failure");
        assert!(app.store.get_wallet(client.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_reference_is_not_found() {
        let app = app();
        let (status, _) = send(
            &app.router,
            Method::POST,
            "/api/mpesa/callback",
            None,
            Some(callback("no-such-reference", 0)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
