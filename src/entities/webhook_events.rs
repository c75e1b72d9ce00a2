use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::payments::PaymentGateway;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema, DeriveActiveEnum, EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(None)")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    #[sea_orm(string_value = "received")]
    Received,
    #[sea_orm(string_value = "processed")]
    Processed,
    /// Processing failed; picked up again by the retry sweep.
    #[sea_orm(string_value = "failed")]
    Failed,
    /// Recognized but intentionally not handled (unknown type, stale, duplicate).
    #[sea_orm(string_value = "ignored")]
    Ignored,
}

impl std::fmt::Display for WebhookEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookEventStatus::Received => write!(f, "received"),
            WebhookEventStatus::Processed => write!(f, "processed"),
            WebhookEventStatus::Failed => write!(f, "failed"),
            WebhookEventStatus::Ignored => write!(f, "ignored"),
        }
    }
}

/// Inbox of every webhook delivery. The unique (gateway, event_id) index is
/// what makes redeliveries idempotent.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub gateway: PaymentGateway,
    pub event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    pub payload: Json,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
