//! Admin login and registration

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    middleware,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub email: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<LoginResponse>> {
    // A missing user and a wrong password answer identically
    let user = state
        .storage
        .get_user_by_email(&body.email)
        .await
        .map_err(|_| Error::Unauthorized("invalid credentials".to_string()))?;

    let valid = bcrypt::verify(&body.password, &user.password_hash)
        .map_err(|e| Error::Internal(format!("password verification failed: {e}")))?;
    if !valid {
        return Err(Error::Unauthorized("invalid credentials".to_string()));
    }

    let token = middleware::issue_token(&state.config.auth, &user)?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        email: user.email,
    }))
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> Result<impl IntoResponse> {
    if body.password.len() < 8 {
        return Err(Error::ValidationError(
            "password must be at least 8 characters".to_string(),
        ));
    }

    let password_hash = bcrypt::hash(&body.password, bcrypt::DEFAULT_COST)
        .map_err(|e| Error::Internal(format!("password hashing failed: {e}")))?;

    let user = state.storage.create_user(&body.email, &password_hash).await?;

    Ok((StatusCode::CREATED, Json(user)))
}
