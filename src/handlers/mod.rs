pub mod auth;
pub mod course;
pub mod payment;
pub mod subscription;
pub mod webhook;

pub use auth::auth_config;
pub use course::course_config;
pub use payment::payment_config;
pub use subscription::subscription_config;
pub use webhook::webhook_config;

use crate::error::AppError;
use crate::middlewares::CurrentUser;
use actix_web::{HttpMessage, HttpRequest};

fn current_user(req: &HttpRequest) -> Result<CurrentUser, AppError> {
    req.extensions()
        .get::<CurrentUser>()
        .cloned()
        .ok_or_else(|| AppError::AuthError("Not authenticated".to_string()))
}

fn require_admin(req: &HttpRequest) -> Result<CurrentUser, AppError> {
    let user = current_user(req)?;
    if user.role != "admin" {
        return Err(AppError::Forbidden);
    }
    Ok(user)
}
