// handler/notifications.rs
use std::sync::Arc;

use axum::{extract::Query, response::IntoResponse, routing::get, Extension, Json, Router};
use validator::Validate;

use crate::{
    db::NotificationExt,
    dtos::{ApiResponse, RequestQueryDto},
    error::HttpError,
    middleware::JWTAuthMiddeware,
    AppState,
};

pub fn notifications_handler() -> Router {
    Router::new()
        .route("/", get(get_user_notifications))
        .route("/unread-count", get(get_unread_count))
}

pub async fn get_unread_count(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
) -> Result<impl IntoResponse, HttpError> {
    let count = app_state.store.count_unread(auth.principal.id).await?;

    Ok(Json(ApiResponse::success("Unread notifications counted", count)))
}

pub async fn get_user_notifications(
    Extension(app_state): Extension<Arc<AppState>>,
    Extension(auth): Extension<JWTAuthMiddeware>,
    Query(query): Query<RequestQueryDto>,
) -> Result<impl IntoResponse, HttpError> {
    query
        .validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let notifications = app_state
        .store
        .list_notifications(auth.principal.id, query.limit() as i64)
        .await?;

    // Listing counts as reading; the response still shows what was unread.
    let marked = app_state.store.mark_all_read(auth.principal.id).await?;
    if marked > 0 {
        tracing::debug!("marked {} notifications read for {}", marked, auth.principal.id);
    }

    Ok(Json(ApiResponse::success(
        "Notifications retrieved successfully",
        notifications,
    )))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::{Method, StatusCode};

    use crate::handler::test_support::{app, send, user};
    use crate::models::{notificationmodel::NotificationCategory, usermodel::UserRole};

    #[tokio::test]
    async fn users_see_their_own_notifications() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let other = user(&app.store, UserRole::Client, "Baraka", &[]);

        app.state.notifications.notify(
            client.id,
            "Deposit of 100 received",
            NotificationCategory::Payment,
            None,
        );
        app.state.notifications.notify(
            other.id,
            "Not for you",
            NotificationCategory::Payment,
            None,
        );

        let mut body = serde_json::Value::Null;
        for _ in 0..50 {
            let (status, response) =
                send(&app.router, Method::GET, "/api/notifications", Some(&client), None).await;
            assert_eq!(status, StatusCode::OK);
            body = response;
            if body["data"].as_array().map(|items| !items.is_empty()).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let items = body["data"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["message"], "Deposit of 100 received");
        assert_eq!(items[0]["category"], "payment");
    }

    #[tokio::test]
    async fn listing_marks_notifications_read() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        for message in ["Budget confirmed", "Booking completed"] {
            app.state
                .notifications
                .notify(client.id, message, NotificationCategory::Booking, None);
        }

        let mut unread = serde_json::Value::Null;
        for _ in 0..50 {
            let (status, response) = send(
                &app.router,
                Method::GET,
                "/api/notifications/unread-count",
                Some(&client),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            unread = response["data"].clone();
            if unread == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(unread, 2);

        let (status, body) =
            send(&app.router, Method::GET, "/api/notifications", Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["data"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item["is_read"] == false));

        let (_, body) = send(
            &app.router,
            Method::GET,
            "/api/notifications/unread-count",
            Some(&client),
            None,
        )
        .await;
        assert_eq!(body["data"], 0);

        let (_, body) =
            send(&app.router, Method::GET, "/api/notifications", Some(&client), None).await;
        let items = body["data"].as_array().unwrap();
        assert!(items.iter().all(|item| item["is_read"] == true));
    }

    #[tokio::test]
    async fn connected_users_receive_pushes() {
        let app = app();
        let client = user(&app.store, UserRole::Client, "Wanjiru", &[]);
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        app.state.registry.register(client.id, sender);

        app.state.notifications.notify(
            client.id,
            "Your booking is in progress",
            NotificationCategory::Booking,
            None,
        );

        let payload = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        let event: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(event["event"], "notification");
        assert_eq!(event["data"]["message"], "Your booking is in progress");
    }
}
