use crate::entities::{EnrollmentStatus, course_entity, enrollment_entity};
use crate::error::{AppError, AppResult};
use crate::models::{
    CourseQuery, CourseResponse, CreateCourseRequest, EnrollmentResponse, PaginatedResponse,
    PaginationParams, UpdateCourseRequest,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

#[derive(Clone)]
pub struct CourseService {
    pool: DatabaseConnection,
}

impl CourseService {
    pub fn new(pool: DatabaseConnection) -> Self {
        Self { pool }
    }

    pub async fn create_course(&self, req: CreateCourseRequest) -> AppResult<CourseResponse> {
        if req.title.trim().is_empty() {
            return Err(AppError::ValidationError("Title must not be empty".to_string()));
        }
        if req.price < 0.0 {
            return Err(AppError::ValidationError("Price must not be negative".to_string()));
        }

        let course = course_entity::ActiveModel {
            title: Set(req.title.trim().to_string()),
            description: Set(req.description),
            price: Set(req.price),
            currency: Set(req.currency.to_ascii_lowercase()),
            is_published: Set(true),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        Ok(CourseResponse::from(course))
    }

    pub async fn update_course(
        &self,
        course_id: i64,
        req: UpdateCourseRequest,
    ) -> AppResult<CourseResponse> {
        let course = self.get_course_model(course_id).await?;
        let mut am = course.into_active_model();

        if let Some(title) = req.title {
            am.title = Set(title);
        }
        if let Some(description) = req.description {
            am.description = Set(Some(description));
        }
        if let Some(price) = req.price {
            if price < 0.0 {
                return Err(AppError::ValidationError(
                    "Price must not be negative".to_string(),
                ));
            }
            am.price = Set(price);
        }
        if let Some(is_published) = req.is_published {
            am.is_published = Set(is_published);
        }
        am.updated_at = Set(Some(Utc::now()));

        let course = am.update(&self.pool).await?;
        Ok(CourseResponse::from(course))
    }

    pub async fn get_course(&self, course_id: i64) -> AppResult<CourseResponse> {
        Ok(CourseResponse::from(self.get_course_model(course_id).await?))
    }

    pub async fn get_course_model(&self, course_id: i64) -> AppResult<course_entity::Model> {
        course_entity::Entity::find_by_id(course_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Course not found".to_string()))
    }

    pub async fn list_published_courses(
        &self,
        query: &CourseQuery,
    ) -> AppResult<PaginatedResponse<CourseResponse>> {
        let params = PaginationParams::new(query.page, query.per_page);

        let base = course_entity::Entity::find()
            .filter(course_entity::Column::IsPublished.eq(true));

        let total = base.clone().count(&self.pool).await? as i64;
        let courses = base
            .order_by_desc(course_entity::Column::CreatedAt)
            .offset(params.get_offset() as u64)
            .limit(params.get_limit() as u64)
            .all(&self.pool)
            .await?;

        Ok(PaginatedResponse::new(
            courses.into_iter().map(CourseResponse::from).collect(),
            params.page.unwrap_or(1),
            params.get_limit(),
            total,
        ))
    }

    /// Start an enrollment in `pending_payment`. Checkout is a separate
    /// step; the enrollment only becomes active once a payment succeeds.
    pub async fn enroll(&self, user_id: i64, course_id: i64) -> AppResult<EnrollmentResponse> {
        let course = self.get_course_model(course_id).await?;
        if !course.is_published {
            return Err(AppError::ValidationError(
                "Course is not available for enrollment".to_string(),
            ));
        }

        let existing = enrollment_entity::Entity::find()
            .filter(enrollment_entity::Column::UserId.eq(user_id))
            .filter(enrollment_entity::Column::CourseId.eq(course_id))
            .one(&self.pool)
            .await?;

        match existing {
            Some(e)
                if matches!(
                    e.status,
                    EnrollmentStatus::Active | EnrollmentStatus::Completed
                ) =>
            {
                Err(AppError::Conflict(
                    "Already enrolled in this course".to_string(),
                ))
            }
            // A pending or cancelled enrollment is reused for the new
            // checkout attempt.
            Some(e) => {
                let mut am = e.into_active_model();
                am.status = Set(EnrollmentStatus::PendingPayment);
                am.updated_at = Set(Some(Utc::now()));
                let e = am.update(&self.pool).await?;
                Ok(EnrollmentResponse::from(e))
            }
            None => {
                let e = enrollment_entity::ActiveModel {
                    user_id: Set(user_id),
                    course_id: Set(course_id),
                    status: Set(EnrollmentStatus::PendingPayment),
                    created_at: Set(Some(Utc::now())),
                    updated_at: Set(Some(Utc::now())),
                    ..Default::default()
                }
                .insert(&self.pool)
                .await?;
                log::info!("Enrollment {} opened for user {user_id}, course {course_id}", e.id);
                Ok(EnrollmentResponse::from(e))
            }
        }
    }

    pub async fn list_user_enrollments(&self, user_id: i64) -> AppResult<Vec<EnrollmentResponse>> {
        let enrollments = enrollment_entity::Entity::find()
            .filter(enrollment_entity::Column::UserId.eq(user_id))
            .order_by_desc(enrollment_entity::Column::CreatedAt)
            .all(&self.pool)
            .await?;
        Ok(enrollments.into_iter().map(EnrollmentResponse::from).collect())
    }

    /// Whether the user currently has an active enrollment in the course.
    pub async fn is_enrolled(&self, user_id: i64, course_id: i64) -> AppResult<bool> {
        let enrollment = enrollment_entity::Entity::find()
            .filter(enrollment_entity::Column::UserId.eq(user_id))
            .filter(enrollment_entity::Column::CourseId.eq(course_id))
            .filter(enrollment_entity::Column::Status.eq(EnrollmentStatus::Active))
            .one(&self.pool)
            .await?;
        Ok(enrollment.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_service() -> CourseService {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&pool, None).await.unwrap();
        CourseService::new(pool)
    }

    fn course_request(title: &str, price: f64) -> CreateCourseRequest {
        CreateCourseRequest {
            title: title.to_string(),
            description: None,
            price,
            currency: "usd".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_list_courses() {
        let svc = test_service().await;
        svc.create_course(course_request("Rust 101", 49.99)).await.unwrap();
        let unpublished = svc.create_course(course_request("Draft", 9.99)).await.unwrap();
        svc.update_course(
            unpublished.id,
            UpdateCourseRequest {
                title: None,
                description: None,
                price: None,
                is_published: Some(false),
            },
        )
        .await
        .unwrap();

        let page = svc
            .list_published_courses(&CourseQuery {
                page: None,
                per_page: None,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].title, "Rust 101");
    }

    #[tokio::test]
    async fn test_negative_price_is_rejected() {
        let svc = test_service().await;
        assert!(svc.create_course(course_request("Bad", -1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_enroll_opens_pending_enrollment() {
        let svc = test_service().await;
        let course = svc.create_course(course_request("Rust 101", 49.99)).await.unwrap();

        let enrollment = svc.enroll(1, course.id).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::PendingPayment);

        // A second call before payment reuses the same row
        let again = svc.enroll(1, course.id).await.unwrap();
        assert_eq!(again.id, enrollment.id);
        assert_eq!(again.status, EnrollmentStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_enroll_conflicts_when_already_active() {
        let svc = test_service().await;
        let course = svc.create_course(course_request("Rust 101", 49.99)).await.unwrap();
        let enrollment = svc.enroll(1, course.id).await.unwrap();

        let mut am = enrollment_entity::Entity::find_by_id(enrollment.id)
            .one(&svc.pool)
            .await
            .unwrap()
            .unwrap()
            .into_active_model();
        am.status = Set(EnrollmentStatus::Active);
        am.update(&svc.pool).await.unwrap();

        let err = svc.enroll(1, course.id).await;
        assert!(matches!(err, Err(AppError::Conflict(_))));
    }
}
