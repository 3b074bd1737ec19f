#![forbid(unsafe_code)]

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum AuthError {
    MissingField(&'static str),
    InvalidCredentials,
    UserNotFound,
    CorruptRecord,
    StoreError(String),
    HashError(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingField(field) => {
                (StatusCode::BAD_REQUEST, format!("user {field} is required"))
            }
            AuthError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "Invalid credentials".to_string()),
            AuthError::UserNotFound => (StatusCode::NOT_FOUND, "User not found".to_string()),
            AuthError::CorruptRecord => (StatusCode::INTERNAL_SERVER_ERROR, "Invalid user data".to_string()),
            AuthError::StoreError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string()),
            AuthError::HashError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Password hash error".to_string()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Stored under `user:<email>`. `password` holds an argon2 PHC string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "name", default)]
    pub user_name: String,
    pub password: String,
    #[serde(default)]
    pub token: String,
}

/// User record as returned over HTTP: never carries the password hash.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct UserInfo {
    pub email: String,
    pub id: i64,
    pub name: String,
    pub token: String,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            email: user.email,
            id: user.id,
            name: user.user_name,
            token: user.token,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}
