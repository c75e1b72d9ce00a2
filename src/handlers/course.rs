use super::{current_user, require_admin};
use crate::models::*;
use crate::services::CourseService;
use actix_web::{HttpRequest, HttpResponse, ResponseError, Result, web};
use serde_json::json;

#[utoipa::path(
    get,
    path = "/courses",
    tag = "course",
    params(CourseQuery),
    responses(
        (status = 200, description = "Published courses, paginated")
    )
)]
pub async fn list_courses(
    course_service: web::Data<CourseService>,
    query: web::Query<CourseQuery>,
) -> Result<HttpResponse> {
    match course_service.list_published_courses(&query).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    get,
    path = "/courses/{id}",
    tag = "course",
    responses(
        (status = 200, description = "Course detail", body = CourseResponse),
        (status = 404, description = "Course not found")
    )
)]
pub async fn get_course(
    course_service: web::Data<CourseService>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    match course_service.get_course(path.into_inner()).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/courses",
    tag = "course",
    security(("bearer_auth" = [])),
    request_body = CreateCourseRequest,
    responses(
        (status = 200, description = "Course created", body = CourseResponse),
        (status = 403, description = "Admin only")
    )
)]
pub async fn create_course(
    course_service: web::Data<CourseService>,
    req: HttpRequest,
    request: web::Json<CreateCourseRequest>,
) -> Result<HttpResponse> {
    if let Err(e) = require_admin(&req) {
        return Ok(e.error_response());
    }
    match course_service.create_course(request.into_inner()).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    put,
    path = "/courses/{id}",
    tag = "course",
    security(("bearer_auth" = [])),
    request_body = UpdateCourseRequest,
    responses(
        (status = 200, description = "Course updated", body = CourseResponse),
        (status = 403, description = "Admin only"),
        (status = 404, description = "Course not found")
    )
)]
pub async fn update_course(
    course_service: web::Data<CourseService>,
    req: HttpRequest,
    path: web::Path<i64>,
    request: web::Json<UpdateCourseRequest>,
) -> Result<HttpResponse> {
    if let Err(e) = require_admin(&req) {
        return Ok(e.error_response());
    }
    match course_service
        .update_course(path.into_inner(), request.into_inner())
        .await
    {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/enrollments",
    tag = "course",
    security(("bearer_auth" = [])),
    request_body = EnrollRequest,
    responses(
        (status = 200, description = "Enrollment opened, awaiting payment", body = EnrollmentResponse),
        (status = 400, description = "Course not available or already enrolled"),
        (status = 404, description = "Course not found")
    )
)]
pub async fn enroll(
    course_service: web::Data<CourseService>,
    req: HttpRequest,
    request: web::Json<EnrollRequest>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match course_service.enroll(user.id, request.course_id).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    get,
    path = "/enrollments",
    tag = "course",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "The caller's enrollments"),
        (status = 401, description = "Not authenticated")
    )
)]
pub async fn my_enrollments(
    course_service: web::Data<CourseService>,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match course_service.list_user_enrollments(user.id).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

pub fn course_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/courses")
            .route("", web::get().to(list_courses))
            .route("", web::post().to(create_course))
            .route("/{id}", web::get().to(get_course))
            .route("/{id}", web::put().to(update_course)),
    );
    cfg.service(
        web::scope("/enrollments")
            .route("", web::post().to(enroll))
            .route("", web::get().to(my_enrollments)),
    );
}
