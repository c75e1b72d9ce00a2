use crate::entities::{UserRole, user_entity};
use crate::error::{AppError, AppResult};
use crate::models::{AuthResponse, LoginRequest, RegisterRequest, UserResponse};
use crate::utils::{JwtService, hash_password, validate_password, verify_password};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};

#[derive(Clone)]
pub struct AuthService {
    pool: DatabaseConnection,
    jwt_service: JwtService,
}

impl AuthService {
    pub fn new(pool: DatabaseConnection, jwt_service: JwtService) -> Self {
        Self { pool, jwt_service }
    }

    pub async fn register(&self, req: RegisterRequest) -> AppResult<AuthResponse> {
        let email = req.email.trim().to_ascii_lowercase();
        if !email.contains('@') {
            return Err(AppError::ValidationError("Invalid email address".to_string()));
        }
        if req.name.trim().is_empty() {
            return Err(AppError::ValidationError("Name must not be empty".to_string()));
        }
        validate_password(&req.password)?;

        let existing = user_entity::Entity::find()
            .filter(user_entity::Column::Email.eq(email.clone()))
            .one(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(AppError::Conflict("Email is already registered".to_string()));
        }

        let password_hash = hash_password(&req.password)?;
        let user = user_entity::ActiveModel {
            email: Set(email),
            name: Set(req.name.trim().to_string()),
            password_hash: Set(password_hash),
            role: Set(UserRole::Student),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!("User registered: id={}", user.id);
        self.build_auth_response(user)
    }

    pub async fn login(&self, req: LoginRequest) -> AppResult<AuthResponse> {
        let email = req.email.trim().to_ascii_lowercase();
        let user = user_entity::Entity::find()
            .filter(user_entity::Column::Email.eq(email))
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::AuthError("Invalid email or password".to_string()))?;

        if !verify_password(&req.password, &user.password_hash)? {
            return Err(AppError::AuthError("Invalid email or password".to_string()));
        }

        self.build_auth_response(user)
    }

    pub async fn refresh(&self, refresh_token: &str) -> AppResult<AuthResponse> {
        let claims = self.jwt_service.verify_refresh_token(refresh_token)?;
        let user_id: i64 = claims
            .sub
            .parse()
            .map_err(|_| AppError::AuthError("Invalid token subject".to_string()))?;

        let user = user_entity::Entity::find_by_id(user_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::AuthError("User no longer exists".to_string()))?;

        self.build_auth_response(user)
    }

    pub async fn get_user(&self, user_id: i64) -> AppResult<user_entity::Model> {
        user_entity::Entity::find_by_id(user_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))
    }

    fn build_auth_response(&self, user: user_entity::Model) -> AppResult<AuthResponse> {
        let role = user.role.to_string();
        let access_token = self.jwt_service.generate_access_token(user.id, &role)?;
        let refresh_token = self.jwt_service.generate_refresh_token(user.id, &role)?;
        Ok(AuthResponse {
            access_token,
            refresh_token,
            expires_in: self.jwt_service.get_access_token_expires_in(),
            user: UserResponse::from(user),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_service() -> AuthService {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&pool, None).await.unwrap();
        AuthService::new(pool, JwtService::new("test-secret", 3600, 86400))
    }

    fn register_request(email: &str) -> RegisterRequest {
        RegisterRequest {
            email: email.to_string(),
            name: "Test Student".to_string(),
            password: "password123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let svc = test_service().await;
        let auth = svc.register(register_request("student@example.com")).await.unwrap();
        assert_eq!(auth.user.email, "student@example.com");
        assert!(!auth.access_token.is_empty());

        let auth = svc
            .login(LoginRequest {
                email: "Student@Example.com".to_string(),
                password: "password123".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(auth.user.role, UserRole::Student);
    }

    #[tokio::test]
    async fn test_duplicate_email_is_rejected() {
        let svc = test_service().await;
        svc.register(register_request("dup@example.com")).await.unwrap();
        let err = svc.register(register_request("dup@example.com")).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_wrong_password_is_rejected() {
        let svc = test_service().await;
        svc.register(register_request("who@example.com")).await.unwrap();
        let err = svc
            .login(LoginRequest {
                email: "who@example.com".to_string(),
                password: "wrong-password1".to_string(),
            })
            .await;
        assert!(matches!(err, Err(AppError::AuthError(_))));
    }

    #[tokio::test]
    async fn test_refresh_token_flow() {
        let svc = test_service().await;
        let auth = svc.register(register_request("r@example.com")).await.unwrap();

        let refreshed = svc.refresh(&auth.refresh_token).await.unwrap();
        assert_eq!(refreshed.user.id, auth.user.id);

        // Access tokens must not work as refresh tokens
        assert!(svc.refresh(&auth.access_token).await.is_err());
    }
}
