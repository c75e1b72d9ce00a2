use crate::entities::{PaymentGateway, PaymentStatus, payment_entity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateStripePaymentIntentRequest {
    pub enrollment_id: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateStripePaymentIntentResponse {
    pub payment_intent_id: String,
    pub client_secret: String,
    /// Id of the local payment record created for this checkout.
    pub payment_db_id: i64,
    pub amount_in_smallest_unit: i64,
    pub currency: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatePayPalOrderRequest {
    pub enrollment_id: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreatePayPalOrderResponse {
    pub order_id: String,
    pub approval_link: Option<String>,
    pub payment_db_id: i64,
    pub amount_in_smallest_unit: i64,
    pub currency: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CapturePayPalOrderResponse {
    pub payment: PaymentResponse,
    pub enrollment_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateRefundRequest {
    pub payment_intent_id: String,
    /// Amount to refund in the smallest currency unit. Omit for a full
    /// refund of the remaining refundable balance.
    pub amount_in_smallest_unit: Option<i64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RefundResponse {
    pub refund_id: String,
    pub amount_in_smallest_unit: i64,
    pub total_refunded_in_smallest_unit: i64,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Serialize, Deserialize, IntoParams)]
pub struct PaymentHistoryQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub status: Option<PaymentStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RefundAttemptStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One entry of the `payments.refund_attempts` JSON array.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RefundAttempt {
    pub refund_id: String,
    pub amount_in_smallest_unit: i64,
    pub status: RefundAttemptStatus,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentResponse {
    pub id: i64,
    pub course_id: Option<i64>,
    pub subscription_id: Option<i64>,
    pub amount: f64,
    pub amount_in_smallest_unit: i64,
    pub currency: String,
    pub payment_gateway: PaymentGateway,
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub total_refunded_in_smallest_unit: i64,
    pub refund_attempts: Vec<RefundAttempt>,
    pub created_at: DateTime<Utc>,
}

impl From<payment_entity::Model> for PaymentResponse {
    fn from(m: payment_entity::Model) -> Self {
        let refund_attempts = m
            .refund_attempts
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        Self {
            id: m.id,
            course_id: m.course_id,
            subscription_id: m.subscription_id,
            amount: m.amount,
            amount_in_smallest_unit: m.amount_in_smallest_unit,
            currency: m.currency,
            payment_gateway: m.payment_gateway,
            transaction_id: m.transaction_id,
            status: m.status,
            total_refunded_in_smallest_unit: m.total_refunded_in_smallest_unit,
            refund_attempts,
            created_at: m.created_at.unwrap_or_else(Utc::now),
        }
    }
}
