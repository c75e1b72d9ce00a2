pub mod courses;
pub mod enrollments;
pub mod payments;
pub mod subscription_plans;
pub mod user_subscriptions;
pub mod users;
pub mod webhook_events;

pub use courses as course_entity;
pub use enrollments as enrollment_entity;
pub use payments as payment_entity;
pub use subscription_plans as subscription_plan_entity;
pub use user_subscriptions as user_subscription_entity;
pub use users as user_entity;
pub use webhook_events as webhook_event_entity;

pub use enrollments::EnrollmentStatus;
pub use payments::{PaymentGateway, PaymentStatus};
pub use subscription_plans::PlanInterval;
pub use user_subscriptions::{SubscriptionGateway, SubscriptionStatus};
pub use users::UserRole;
pub use webhook_events::WebhookEventStatus;
