#![forbid(unsafe_code)]

use crate::auth::{self, types::*};
use crate::signaling::SignalingServer;
use axum::{
    extract::{Query, State},
    Json,
};
use tracing::{info, warn};

/// GET /api/v1/user?email=
pub async fn get_user(
    State(server): State<SignalingServer>,
    Query(req): Query<UserRequest>,
) -> Result<Json<UserInfo>, AuthError> {
    if req.email.is_empty() {
        return Err(AuthError::MissingField("email"));
    }
    let user = auth::load_user(server.store().as_ref(), &req.email).await?;
    Ok(Json(user.into()))
}

/// POST /api/v1/login
pub async fn login(
    State(server): State<SignalingServer>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<UserInfo>, AuthError> {
    match auth::authenticate(server.store().as_ref(), &req.email, &req.password).await {
        Ok(user) => {
            info!("User logged in: {}", user.email);
            Ok(Json(user.into()))
        }
        Err(e) => {
            warn!("Login failed for {}: {:?}", req.email, e);
            Err(e)
        }
    }
}
