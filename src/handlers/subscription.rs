use super::{current_user, require_admin};
use crate::models::*;
use crate::services::SubscriptionService;
use actix_web::{HttpRequest, HttpResponse, ResponseError, Result, web};
use serde_json::json;

#[utoipa::path(
    get,
    path = "/subscriptions/plans",
    tag = "subscription",
    responses(
        (status = 200, description = "Active plans")
    )
)]
pub async fn list_plans(
    subscription_service: web::Data<SubscriptionService>,
) -> Result<HttpResponse> {
    match subscription_service.list_active_plans().await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/subscriptions/plans",
    tag = "subscription",
    security(("bearer_auth" = [])),
    request_body = CreatePlanRequest,
    responses(
        (status = 200, description = "Plan created", body = PlanResponse),
        (status = 403, description = "Admin only")
    )
)]
pub async fn create_plan(
    subscription_service: web::Data<SubscriptionService>,
    req: HttpRequest,
    request: web::Json<CreatePlanRequest>,
) -> Result<HttpResponse> {
    if let Err(e) = require_admin(&req) {
        return Ok(e.error_response());
    }
    match subscription_service.create_plan(request.into_inner()).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    put,
    path = "/subscriptions/plans/{id}",
    tag = "subscription",
    security(("bearer_auth" = [])),
    request_body = UpdatePlanRequest,
    responses(
        (status = 200, description = "Plan updated", body = PlanResponse),
        (status = 403, description = "Admin only"),
        (status = 404, description = "Plan not found")
    )
)]
pub async fn update_plan(
    subscription_service: web::Data<SubscriptionService>,
    req: HttpRequest,
    path: web::Path<i64>,
    request: web::Json<UpdatePlanRequest>,
) -> Result<HttpResponse> {
    if let Err(e) = require_admin(&req) {
        return Ok(e.error_response());
    }
    match subscription_service
        .update_plan(path.into_inner(), request.into_inner())
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
    path = "/subscriptions",
    tag = "subscription",
    security(("bearer_auth" = [])),
    request_body = CreateSubscriptionRequest,
    responses(
        (status = 200, description = "Subscription started", body = CreateSubscriptionResponse),
        (status = 400, description = "User already has a subscription")
    )
)]
pub async fn create_subscription(
    subscription_service: web::Data<SubscriptionService>,
    req: HttpRequest,
    request: web::Json<CreateSubscriptionRequest>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match subscription_service
        .create_subscription(user.id, request.into_inner())
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
    path = "/subscriptions/cancel",
    tag = "subscription",
    security(("bearer_auth" = [])),
    request_body = CancelSubscriptionRequest,
    responses(
        (status = 200, description = "Cancellation applied", body = SubscriptionResponse),
        (status = 404, description = "No active subscription")
    )
)]
pub async fn cancel_subscription(
    subscription_service: web::Data<SubscriptionService>,
    req: HttpRequest,
    request: web::Json<CancelSubscriptionRequest>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match subscription_service
        .cancel_subscription(user.id, request.into_inner())
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
    path = "/subscriptions/change-plan",
    tag = "subscription",
    security(("bearer_auth" = [])),
    request_body = ChangePlanRequest,
    responses(
        (status = 200, description = "Plan changed with proration", body = SubscriptionResponse),
        (status = 400, description = "Unsupported for PayPal subscriptions"),
        (status = 404, description = "No active subscription")
    )
)]
pub async fn change_plan(
    subscription_service: web::Data<SubscriptionService>,
    req: HttpRequest,
    request: web::Json<ChangePlanRequest>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match subscription_service
        .change_plan(user.id, request.into_inner())
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
    get,
    path = "/subscriptions/me",
    tag = "subscription",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "The caller's current subscription, if any")
    )
)]
pub async fn my_subscription(
    subscription_service: web::Data<SubscriptionService>,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match subscription_service.get_my_subscription(user.id).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

pub fn subscription_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/subscriptions")
            .route("/plans", web::get().to(list_plans))
            .route("/plans", web::post().to(create_plan))
            .route("/plans/{id}", web::put().to(update_plan))
            .route("/cancel", web::post().to(cancel_subscription))
            .route("/change-plan", web::post().to(change_plan))
            .route("/me", web::get().to(my_subscription))
            .route("", web::post().to(create_subscription)),
    );
}
