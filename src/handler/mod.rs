pub mod booking;
pub mod mpesa;
pub mod notifications;
pub mod realtime;
pub mod revenue;
pub mod transactions;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::{
        config::{Config, MpesaConfig, PayPalConfig},
        db::memory::MemoryStore,
        models::usermodel::{Principal, User, UserRole},
        routes::create_router,
        service::payment_service::tests::{FakeMobileMoney, FakePayouts},
        utils::token::create_token,
        AppState,
    };

    pub const SECRET: &str = "handler-test-secret";

    pub struct TestApp {
        pub router: Router,
        pub store: Arc<MemoryStore>,
        pub state: Arc<AppState>,
    }

    fn config() -> Config {
        Config {
            database_url: None,
            jwt_secret: SECRET.to_string(),
            jwt_maxage: 60,
            port: 8000,
            allowed_origins: vec!["http://localhost:5173".to_string()],
            mpesa: MpesaConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                consumer_key: String::new(),
                consumer_secret: String::new(),
                shortcode: "174379".to_string(),
                passkey: String::new(),
                callback_url: String::new(),
            },
            paypal: PayPalConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                client_id: String::new(),
                client_secret: String::new(),
            },
        }
    }

    pub fn app() -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(AppState::new(
            config(),
            store.clone(),
            Arc::new(FakeMobileMoney),
            Arc::new(FakePayouts::default()),
        ));
        TestApp {
            router: create_router(state.clone()),
            store,
            state,
        }
    }

    pub fn user(store: &MemoryStore, role: UserRole, name: &str, services: &[&str]) -> Principal {
        let user = User {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            role,
            services: services.iter().map(|s| s.to_string()).collect(),
            is_available: true,
            device_token: None,
            created_at: chrono::Utc::now(),
        };
        let principal = Principal::from(&user);
        store.insert_user(user);
        principal
    }

    pub fn token(principal: &Principal) -> String {
        create_token(principal, SECRET.as_bytes(), 60).unwrap()
    }

    pub async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        principal: Option<&Principal>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(principal) = principal {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token(principal)));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }
}
