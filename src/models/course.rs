use crate::entities::course_entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateCourseRequest {
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateCourseRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, IntoParams)]
pub struct CourseQuery {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CourseResponse {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub price: f64,
    pub currency: String,
    pub is_published: bool,
    pub created_at: DateTime<Utc>,
}

impl From<course_entity::Model> for CourseResponse {
    fn from(m: course_entity::Model) -> Self {
        Self {
            id: m.id,
            title: m.title,
            description: m.description,
            price: m.price,
            currency: m.currency,
            is_published: m.is_published,
            created_at: m.created_at.unwrap_or_else(Utc::now),
        }
    }
}
