use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::IntoResponse,
    Extension,
};
use axum_extra::extract::cookie::CookieJar;

use crate::{
    error::{ErrorMessage, HttpError},
    models::usermodel::{Principal, UserRole},
    utils::token,
    AppState,
};

#[derive(Debug, Clone, Copy)]
pub struct JWTAuthMiddeware {
    pub principal: Principal,
}

/// Reads the bearer token from the `token` cookie or the Authorization header.
pub fn extract_token(cookie_jar: &CookieJar, req: &Request) -> Option<String> {
    cookie_jar
        .get("token")
        .map(|cookie| cookie.value().to_string())
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|auth_header| auth_header.to_str().ok())
                .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
                .map(|token| token.to_owned())
        })
}

pub async fn auth(
    cookie_jar: CookieJar,
    Extension(app_state): Extension<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, HttpError> {
    let token = extract_token(&cookie_jar, &req).ok_or_else(|| {
        HttpError::unauthorized(ErrorMessage::TokenNotProvided.to_string())
            .with_kind("Unauthenticated")
    })?;

    let principal = token::decode_token(token, app_state.env.jwt_secret.as_bytes())
        .map_err(|e| e.with_kind("Unauthenticated"))?;

    req.extensions_mut().insert(JWTAuthMiddeware { principal });

    Ok(next.run(req).await)
}

pub async fn role_check(
    Extension(_app_state): Extension<Arc<AppState>>,
    req: Request,
    next: Next,
    required_roles: Vec<UserRole>,
) -> Result<impl IntoResponse, HttpError> {
    let auth = req
        .extensions()
        .get::<JWTAuthMiddeware>()
        .ok_or_else(|| {
            HttpError::unauthorized(ErrorMessage::UserNotAuthenticated.to_string())
                .with_kind("Unauthenticated")
        })?;

    if !required_roles.contains(&auth.principal.role) {
        return Err(
            HttpError::new(ErrorMessage::PermissionDenied.to_string(), StatusCode::FORBIDDEN)
                .with_kind("Forbidden"),
        );
    }

    Ok(next.run(req).await)
}
