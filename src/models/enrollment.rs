use crate::entities::{EnrollmentStatus, enrollment_entity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EnrollRequest {
    pub course_id: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EnrollmentResponse {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub status: EnrollmentStatus,
    pub payment_transaction_id: Option<String>,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<enrollment_entity::Model> for EnrollmentResponse {
    fn from(m: enrollment_entity::Model) -> Self {
        Self {
            id: m.id,
            user_id: m.user_id,
            course_id: m.course_id,
            status: m.status,
            payment_transaction_id: m.payment_transaction_id,
            enrolled_at: m.enrolled_at,
            completed_at: m.completed_at,
        }
    }
}
