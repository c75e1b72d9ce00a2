use crate::entities::{
    PlanInterval, SubscriptionGateway, SubscriptionStatus, subscription_plan_entity,
    user_subscription_entity,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatePlanRequest {
    pub name: String,
    pub description: Option<String>,
    pub stripe_price_id: Option<String>,
    pub paypal_plan_id: Option<String>,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub interval: PlanInterval,
    #[serde(default = "default_interval_count")]
    pub interval_count: i32,
    #[serde(default)]
    pub trial_period_days: i32,
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_interval_count() -> i32 {
    1
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdatePlanRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub stripe_price_id: Option<String>,
    pub paypal_plan_id: Option<String>,
    pub price: Option<f64>,
    pub trial_period_days: Option<i32>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PlanResponse {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub currency: String,
    pub interval: PlanInterval,
    pub interval_count: i32,
    pub trial_period_days: i32,
    pub is_active: bool,
}

impl From<subscription_plan_entity::Model> for PlanResponse {
    fn from(m: subscription_plan_entity::Model) -> Self {
        Self {
            id: m.id,
            name: m.name,
            description: m.description,
            price: m.price,
            currency: m.currency,
            interval: m.interval,
            interval_count: m.interval_count,
            trial_period_days: m.trial_period_days,
            is_active: m.is_active,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSubscriptionRequest {
    pub plan_id: i64,
    pub gateway: SubscriptionGateway,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSubscriptionResponse {
    pub subscription: SubscriptionResponse,
    /// Stripe: client secret of the initial invoice's PaymentIntent.
    pub client_secret: Option<String>,
    /// PayPal: link the buyer must visit to approve the subscription.
    pub approval_link: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelSubscriptionRequest {
    /// When true (default) the subscription stays active until the period
    /// ends; when false it is canceled immediately.
    #[serde(default = "default_at_period_end")]
    pub at_period_end: bool,
    pub reason: Option<String>,
}

fn default_at_period_end() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChangePlanRequest {
    pub new_plan_id: i64,
}

/// One entry of the `user_subscriptions.plan_change_history` JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlanChange {
    pub from_plan_id: i64,
    pub to_plan_id: i64,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    pub id: i64,
    pub plan_id: i64,
    pub gateway: SubscriptionGateway,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Whether this subscription currently grants access to gated content.
    pub grants_access: bool,
    pub created_at: DateTime<Utc>,
}

impl From<user_subscription_entity::Model> for SubscriptionResponse {
    fn from(m: user_subscription_entity::Model) -> Self {
        Self {
            id: m.id,
            plan_id: m.plan_id,
            gateway: m.gateway,
            status: m.status,
            current_period_start: m.current_period_start,
            current_period_end: m.current_period_end,
            trial_end: m.trial_end,
            cancel_at_period_end: m.cancel_at_period_end,
            canceled_at: m.canceled_at,
            grants_access: m.status.grants_access(),
            created_at: m.created_at.unwrap_or_else(Utc::now),
        }
    }
}
