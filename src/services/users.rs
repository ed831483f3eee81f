//! Authentication and user management service

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use std::sync::Arc;
use validator::Validate;

use crate::{
    config::{AuthConfig, BootstrapStaff},
    error::{AppError, AppResult},
    models::user::{CreateUser, NewUser, Role, UpdateUser, User, UserClaims},
    repository::Store,
};

fn user_not_found(id: i64) -> AppError {
    AppError::NotFound(format!("User with id {} not found", id))
}

#[derive(Clone)]
pub struct UsersService {
    store: Arc<dyn Store>,
    config: AuthConfig,
}

impl UsersService {
    pub fn new(store: Arc<dyn Store>, config: AuthConfig) -> Self {
        Self { store, config }
    }

    /// Register a new reader account
    pub async fn create_user(&self, request: CreateUser) -> AppResult<User> {
        request.validate()?;

        let user = self
            .store
            .insert_user(&NewUser {
                name: request.name,
                username: request.username,
                password_hash: hash_password(&request.password)?,
                role: Role::User,
            })
            .await?;

        tracing::info!(user_id = user.id, username = %user.username, "User registered");
        Ok(user)
    }

    /// Create the configured staff account unless its username is taken
    pub async fn ensure_staff(&self, staff: &BootstrapStaff) -> AppResult<Option<User>> {
        if self
            .store
            .find_user_by_username(&staff.username)
            .await?
            .is_some()
        {
            tracing::info!(username = %staff.username, "Staff account already present");
            return Ok(None);
        }

        let created = self
            .store
            .insert_user(&NewUser {
                name: staff.name.clone(),
                username: staff.username.clone(),
                password_hash: hash_password(&staff.password)?,
                role: Role::Staff,
            })
            .await;

        match created {
            Ok(user) => {
                tracing::info!(user_id = user.id, username = %user.username, "Staff account created");
                Ok(Some(user))
            }
            // Held by a deleted account; usernames are never reused
            Err(AppError::Conflict(_)) => {
                tracing::warn!(username = %staff.username, "Staff username taken by a deleted account");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Authenticate by username and password and return a JWT
    pub async fn login(&self, username: &str, password: &str) -> AppResult<(String, User)> {
        let user = self
            .store
            .find_user_by_username(username)
            .await?
            .ok_or_else(|| AppError::Authentication("Invalid username or password".to_string()))?;

        if !verify_password(&user, password)? {
            tracing::warn!(username, "Rejected login attempt");
            return Err(AppError::Authentication(
                "Invalid username or password".to_string(),
            ));
        }

        let token = self.create_token_for_user(&user)?;
        Ok((token, user))
    }

    fn create_token_for_user(&self, user: &User) -> AppResult<String> {
        let now = Utc::now().timestamp();
        let exp = now + (self.config.jwt_expiration_hours as i64 * 3600);

        let claims = UserClaims {
            sub: user.id.to_string(),
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
            exp,
            iat: now,
        };

        claims
            .create_token(&self.config.jwt_secret)
            .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))
    }

    /// Get a non-deleted user by ID
    pub async fn get_user(&self, id: i64) -> AppResult<User> {
        self.store
            .find_user(id)
            .await?
            .filter(User::is_active)
            .ok_or_else(|| user_not_found(id))
    }

    /// Change a user's display name
    pub async fn update_user(&self, id: i64, changes: UpdateUser) -> AppResult<User> {
        changes.validate()?;
        self.store
            .update_user_name(id, &changes.name)
            .await?
            .ok_or_else(|| user_not_found(id))
    }

    /// Soft delete a user; their loan history is kept
    pub async fn delete_user(&self, id: i64) -> AppResult<()> {
        if !self.store.soft_delete_user(id, Utc::now()).await? {
            return Err(user_not_found(id));
        }
        tracing::info!(user_id = id, "User deleted");
        Ok(())
    }
}

fn verify_password(user: &User, password: &str) -> AppResult<bool> {
    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;

    fn service() -> UsersService {
        UsersService::new(Arc::new(MemoryStore::new()), AuthConfig::default())
    }

    fn registration(username: &str) -> CreateUser {
        CreateUser {
            name: "Ada".into(),
            username: username.into(),
            password: "correct horse".into(),
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let service = service();
        let user = service.create_user(registration("ada")).await.unwrap();
        assert_eq!(user.role, Role::User);
        assert_ne!(user.password_hash, "correct horse");

        let (token, logged_in) = service.login("ada", "correct horse").await.unwrap();
        assert_eq!(logged_in.id, user.id);

        let claims = UserClaims::from_token(&token, &AuthConfig::default().jwt_secret).unwrap();
        assert_eq!(claims.user_id, user.id);
        assert!(!claims.is_staff());
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let service = service();
        service.create_user(registration("ada")).await.unwrap();

        assert!(matches!(
            service.login("ada", "wrong").await,
            Err(AppError::Authentication(_))
        ));
        assert!(matches!(
            service.login("nobody", "correct horse").await,
            Err(AppError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let service = service();
        service.create_user(registration("ada")).await.unwrap();
        assert!(matches!(
            service.create_user(registration("ada")).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_short_username_is_rejected() {
        assert!(matches!(
            service().create_user(registration("ad")).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_staff_is_idempotent() {
        let service = service();
        let staff = BootstrapStaff {
            name: "Librarian".into(),
            username: "librarian".into(),
            password: "shelves".into(),
        };

        let created = service.ensure_staff(&staff).await.unwrap().unwrap();
        assert_eq!(created.role, Role::Staff);
        assert!(service.ensure_staff(&staff).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleted_user_cannot_log_in() {
        let service = service();
        let user = service.create_user(registration("ada")).await.unwrap();

        let renamed = service
            .update_user(user.id, UpdateUser { name: "Ada L.".into() })
            .await
            .unwrap();
        assert_eq!(renamed.name, "Ada L.");

        service.delete_user(user.id).await.unwrap();
        assert!(matches!(service.get_user(user.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(service.delete_user(user.id).await, Err(AppError::NotFound(_))));
        assert!(matches!(
            service.login("ada", "correct horse").await,
            Err(AppError::Authentication(_))
        ));
    }
}
