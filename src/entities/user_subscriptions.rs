use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema, DeriveActiveEnum, EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(None)")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionGateway {
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "paypal")]
    Paypal,
}

impl std::fmt::Display for SubscriptionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionGateway::Stripe => write!(f, "stripe"),
            SubscriptionGateway::Paypal => write!(f, "paypal"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema, DeriveActiveEnum, EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(None)")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created locally, awaiting checkout completion or buyer approval.
    #[sea_orm(string_value = "incomplete")]
    Incomplete,
    /// PayPal subscription waiting for the buyer to approve.
    #[sea_orm(string_value = "pending_approval")]
    PendingApproval,
    #[sea_orm(string_value = "trialing")]
    Trialing,
    #[sea_orm(string_value = "active")]
    Active,
    /// A renewal charge failed; the gateway is retrying.
    #[sea_orm(string_value = "payment_due")]
    PaymentDue,
    #[sea_orm(string_value = "suspended")]
    Suspended,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl SubscriptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled | SubscriptionStatus::Expired)
    }

    /// Statuses that grant access to subscription-gated content.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
                | SubscriptionStatus::PaymentDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Incomplete => write!(f, "incomplete"),
            SubscriptionStatus::PendingApproval => write!(f, "pending_approval"),
            SubscriptionStatus::Trialing => write!(f, "trialing"),
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::PaymentDue => write!(f, "payment_due"),
            SubscriptionStatus::Suspended => write!(f, "suspended"),
            SubscriptionStatus::Canceled => write!(f, "canceled"),
            SubscriptionStatus::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "user_subscriptions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub gateway: SubscriptionGateway,
    pub stripe_subscription_id: Option<String>,
    pub paypal_subscription_id: Option<String>,
    pub gateway_customer_id: Option<String>,
    /// Stripe price id or PayPal plan id the gateway subscription runs on.
    pub gateway_price_or_plan_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Raw status string as last reported by the gateway.
    pub last_gateway_status: Option<String>,
    pub last_webhook_sync_at: Option<DateTime<Utc>>,
    /// Append-only JSON array of plan changes, see `PlanChange`.
    pub plan_change_history: Option<Json>,
    pub version: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
