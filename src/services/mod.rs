pub mod auth_service;
pub mod course_service;
pub mod payment_service;
pub mod status_map;
pub mod subscription_service;
pub mod webhook_service;

pub use auth_service::*;
pub use course_service::*;
pub use payment_service::*;
pub use subscription_service::*;
pub use webhook_service::*;
