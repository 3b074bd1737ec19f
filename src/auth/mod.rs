#![forbid(unsafe_code)]

pub mod password;
pub mod routes;
pub mod types;

use crate::store::{user_key, Store};
use tracing::warn;
use types::{AuthError, User};

/// Reads and decodes the record stored under `user:<email>`.
pub async fn load_user(store: &dyn Store, email: &str) -> Result<User, AuthError> {
    let raw = store
        .get(&user_key(email))
        .await
        .map_err(|e| AuthError::StoreError(e.to_string()))?
        .ok_or(AuthError::UserNotFound)?;
    serde_json::from_str(&raw).map_err(|e| {
        warn!("Invalid user data for {}: {}", email, e);
        AuthError::CorruptRecord
    })
}

pub async fn store_user(store: &dyn Store, user: &User) -> Result<(), AuthError> {
    let json = serde_json::to_string(user).map_err(|e| AuthError::StoreError(e.to_string()))?;
    store
        .set(&user_key(&user.email), &json)
        .await
        .map_err(|e| AuthError::StoreError(e.to_string()))
}

/// Email and password both present, password matching the stored hash.
pub async fn authenticate(store: &dyn Store, email: &str, password: &str) -> Result<User, AuthError> {
    if email.is_empty() {
        return Err(AuthError::MissingField("email"));
    }
    if password.is_empty() {
        return Err(AuthError::MissingField("password"));
    }
    let user = match load_user(store, email).await {
        Ok(user) => user,
        Err(AuthError::UserNotFound) => return Err(AuthError::InvalidCredentials),
        Err(e) => return Err(e),
    };
    if !password::verify_password(password, &user.password)? {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let user = User {
            email: "a@x.com".to_string(),
            id: 1,
            user_name: "Ana".to_string(),
            password: password::hash_password("hunter22").unwrap(),
            token: String::new(),
        };
        store_user(&store, &user).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_load_user() {
        let store = seeded().await;
        let user = load_user(&store, "a@x.com").await.unwrap();
        assert_eq!(user.user_name, "Ana");
        assert!(matches!(load_user(&store, "b@x.com").await, Err(AuthError::UserNotFound)));

        store.set("user:bad@x.com", "{").await.unwrap();
        assert!(matches!(load_user(&store, "bad@x.com").await, Err(AuthError::CorruptRecord)));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let store = seeded().await;
        assert_eq!(authenticate(&store, "a@x.com", "hunter22").await.unwrap().id, 1);
        assert!(matches!(
            authenticate(&store, "a@x.com", "nope").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&store, "ghost@x.com", "hunter22").await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            authenticate(&store, "", "hunter22").await,
            Err(AuthError::MissingField("email"))
        ));
        assert!(matches!(
            authenticate(&store, "a@x.com", "").await,
            Err(AuthError::MissingField("password"))
        ));
    }
}
