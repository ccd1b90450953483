use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{instrument, warn};

use super::dto::{
    AuditQuery, ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, LoginResponse,
    MessageResponse, RegisterRequest, RegisterResponse, ResetPasswordRequest, RevokeResponse,
    SessionView, TokenRequest,
};
use super::extractors::{AuthSession, BearerToken};
use super::services::{ClientInfo, Registration};
use crate::error::ApiError;
use crate::state::AppState;

pub const MIN_PASSWORD_LEN: usize = 8;

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref USERNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9_.-]{3,32}$").unwrap();
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub(crate) fn is_valid_username(username: &str) -> bool {
    USERNAME_RE.is_match(username)
}

fn check_password(password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/verify-email", post(verify_email))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/change-password", post(change_password))
}

pub fn me_routes() -> Router<AppState> {
    Router::new()
        .route("/me", get(get_me))
        .route("/me/sessions", get(list_sessions).delete(revoke_sessions))
        .route("/me/audit", get(audit_trail))
}

#[instrument(skip(state, client, payload))]
pub async fn register(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = normalize_email(&payload.email);
    let username = payload.username.trim().to_string();

    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(ApiError::BadRequest("Invalid email".into()));
    }
    if !is_valid_username(&username) {
        warn!(username = %username, "invalid username");
        return Err(ApiError::BadRequest(
            "Username must be 3-32 letters, digits, '.', '_' or '-'".into(),
        ));
    }
    check_password(&payload.password)?;

    let user = state
        .auth
        .register(
            Registration {
                username,
                email,
                password: payload.password,
                first_name: payload.first_name.trim().to_string(),
                last_name: payload.last_name.trim().to_string(),
            },
            &client,
        )
        .await?;

    if let Some(token) = user.email_verification_token.as_deref() {
        if let Err(e) = state.notifier.send_email_verification(&user, token).await {
            warn!(error = %e, user_id = %user.user_id, "verification dispatch failed");
        }
    }

    Ok((StatusCode::CREATED, Json(RegisterResponse { user })))
}

#[instrument(skip(state, client, payload))]
pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let identifier = payload.identifier.trim();
    if identifier.is_empty() || payload.password.is_empty() {
        return Err(ApiError::BadRequest("Identifier and password are required".into()));
    }
    // Emails are stored lowercased; usernames keep their case.
    let identifier = if identifier.contains('@') {
        normalize_email(identifier)
    } else {
        identifier.to_string()
    };

    let session = state
        .auth
        .login(&identifier, &payload.password, &client)
        .await?;
    Ok(Json(session.into()))
}

#[instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    client: ClientInfo,
    BearerToken(token): BearerToken,
) -> Result<StatusCode, ApiError> {
    state.auth.logout(&token, &client).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all)]
pub async fn verify_email(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<TokenRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.auth.verify_email(payload.token.trim(), &client).await?;
    Ok(Json(MessageResponse {
        message: "Email verified",
    }))
}

/// Always 202 so the response does not reveal whether the email is registered.
#[instrument(skip(state, client, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = normalize_email(&payload.email);
    if !is_valid_email(&email) {
        return Err(ApiError::BadRequest("Invalid email".into()));
    }

    if let Some(ticket) = state.auth.forgot_password(&email, &client).await? {
        if let Err(e) = state
            .notifier
            .send_password_reset(&ticket.user, &ticket.token)
            .await
        {
            warn!(error = %e, user_id = %ticket.user.user_id, "reset dispatch failed");
        }
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "If the email is registered, a reset link has been sent",
        }),
    ))
}

#[instrument(skip_all)]
pub async fn reset_password(
    State(state): State<AppState>,
    client: ClientInfo,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    check_password(&payload.new_password)?;
    state
        .auth
        .reset_password(payload.token.trim(), &payload.new_password, &client)
        .await?;
    Ok(Json(MessageResponse {
        message: "Password has been reset",
    }))
}

#[instrument(skip_all, fields(user_id = %auth.user.user_id))]
pub async fn change_password(
    State(state): State<AppState>,
    client: ClientInfo,
    auth: AuthSession,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    check_password(&payload.new_password)?;
    state
        .auth
        .change_password(
            auth.user.user_id,
            &payload.current_password,
            &payload.new_password,
            &client,
        )
        .await?;
    Ok(Json(MessageResponse {
        message: "Password changed; please log in again",
    }))
}

#[instrument(skip_all, fields(user_id = %auth.user.user_id))]
pub async fn get_me(auth: AuthSession) -> impl IntoResponse {
    Json(auth.user)
}

#[instrument(skip_all, fields(user_id = %auth.user.user_id))]
pub async fn list_sessions(
    State(state): State<AppState>,
    auth: AuthSession,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let current = auth.session.session_id;
    let sessions = state.auth.list_sessions(auth.user.user_id).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|s| SessionView::new(s, current))
            .collect(),
    ))
}

#[instrument(skip_all, fields(user_id = %auth.user.user_id))]
pub async fn revoke_sessions(
    State(state): State<AppState>,
    client: ClientInfo,
    auth: AuthSession,
) -> Result<Json<RevokeResponse>, ApiError> {
    let revoked = state
        .auth
        .revoke_all_sessions(auth.user.user_id, &client)
        .await?;
    Ok(Json(RevokeResponse { revoked }))
}

#[instrument(skip_all, fields(user_id = %auth.user.user_id))]
pub async fn audit_trail(
    State(state): State<AppState>,
    auth: AuthSession,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .auth
        .audit_trail(auth.user.user_id, query.limit(), query.offset())
        .await?;
    Ok(Json(entries))
}
