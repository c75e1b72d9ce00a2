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
pub enum PaymentGateway {
    #[sea_orm(string_value = "stripe")]
    Stripe,
    #[sea_orm(string_value = "paypal")]
    Paypal,
    #[sea_orm(string_value = "other")]
    Other,
}

impl std::fmt::Display for PaymentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentGateway::Stripe => write!(f, "stripe"),
            PaymentGateway::Paypal => write!(f, "paypal"),
            PaymentGateway::Other => write!(f, "other"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema, DeriveActiveEnum, EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(None)")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "requires_action")]
    RequiresAction,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Canceled | PaymentStatus::Refunded
        )
    }

    /// Whether a transition from `self` to `next` moves the ledger forward.
    ///
    /// Webhooks arrive out of order, so a stale event must never move a row
    /// backwards (e.g. a late `processing` event after `succeeded`).
    pub fn can_transition(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        if *self == next {
            return false;
        }
        match self {
            Pending => matches!(
                next,
                Processing | RequiresAction | Succeeded | Failed | Canceled
            ),
            Processing => matches!(next, RequiresAction | Succeeded | Failed | Canceled),
            RequiresAction => matches!(next, Processing | Succeeded | Failed | Canceled),
            Succeeded => matches!(next, PartiallyRefunded | Refunded),
            PartiallyRefunded => matches!(next, Refunded),
            Failed | Canceled | Refunded => false,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Processing => write!(f, "processing"),
            PaymentStatus::RequiresAction => write!(f, "requires_action"),
            PaymentStatus::Succeeded => write!(f, "succeeded"),
            PaymentStatus::Failed => write!(f, "failed"),
            PaymentStatus::Canceled => write!(f, "canceled"),
            PaymentStatus::PartiallyRefunded => write!(f, "partially_refunded"),
            PaymentStatus::Refunded => write!(f, "refunded"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub course_id: Option<i64>,
    pub enrollment_id: Option<i64>,
    /// Set for payments that belong to a subscription (initial or renewal).
    pub subscription_id: Option<i64>,
    pub amount: f64,
    /// Integer amount in the currency's smallest unit (cents for USD).
    /// All refund accounting is done against this column, never `amount`.
    pub amount_in_smallest_unit: i64,
    pub currency: String,
    pub payment_gateway: PaymentGateway,
    /// Gateway-assigned id: Stripe PaymentIntent id or PayPal order id.
    /// Unique per gateway.
    pub transaction_id: String,
    pub status: PaymentStatus,
    /// Raw status string as last reported by the gateway.
    pub gateway_status: Option<String>,
    pub gateway_response: Option<Json>,
    pub capture_id: Option<String>,
    pub approval_link: Option<String>,
    pub renewal_reason: Option<String>,
    pub total_refunded_in_smallest_unit: i64,
    /// Append-only JSON array of refund attempts, see `RefundAttempt`.
    pub refund_attempts: Option<Json>,
    pub version: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Canceled.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
        assert!(!PaymentStatus::Succeeded.is_terminal());
        assert!(!PaymentStatus::PartiallyRefunded.is_terminal());
    }

    #[test]
    fn test_forward_transitions() {
        use PaymentStatus::*;
        assert!(Pending.can_transition(Processing));
        assert!(Pending.can_transition(Succeeded));
        assert!(Processing.can_transition(Succeeded));
        assert!(RequiresAction.can_transition(Succeeded));
        assert!(Succeeded.can_transition(PartiallyRefunded));
        assert!(Succeeded.can_transition(Refunded));
        assert!(PartiallyRefunded.can_transition(Refunded));
    }

    #[test]
    fn test_stale_events_cannot_move_backwards() {
        use PaymentStatus::*;
        assert!(!Succeeded.can_transition(Processing));
        assert!(!Succeeded.can_transition(Pending));
        assert!(!Refunded.can_transition(Succeeded));
        assert!(!Failed.can_transition(Succeeded));
        assert!(!Canceled.can_transition(Processing));
        assert!(!PartiallyRefunded.can_transition(Succeeded));
    }

    #[test]
    fn test_self_transition_is_noop() {
        assert!(!PaymentStatus::Succeeded.can_transition(PaymentStatus::Succeeded));
        assert!(!PaymentStatus::Pending.can_transition(PaymentStatus::Pending));
    }
}
