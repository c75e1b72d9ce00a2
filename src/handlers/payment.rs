use super::{current_user, require_admin};
use crate::models::*;
use crate::services::PaymentService;
use actix_web::{HttpRequest, HttpResponse, ResponseError, Result, web};
use serde_json::json;

#[utoipa::path(
    post,
    path = "/payments/stripe/create-payment-intent",
    tag = "payment",
    security(("bearer_auth" = [])),
    request_body = CreateStripePaymentIntentRequest,
    responses(
        (status = 200, description = "PaymentIntent created", body = CreateStripePaymentIntentResponse),
        (status = 400, description = "Enrollment not awaiting payment or course not purchasable"),
        (status = 404, description = "Enrollment not found")
    )
)]
pub async fn create_stripe_payment_intent(
    payment_service: web::Data<PaymentService>,
    req: HttpRequest,
    request: web::Json<CreateStripePaymentIntentRequest>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match payment_service
        .create_stripe_payment_intent(user.id, request.into_inner())
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
    path = "/payments/paypal/create-order",
    tag = "payment",
    security(("bearer_auth" = [])),
    request_body = CreatePayPalOrderRequest,
    responses(
        (status = 200, description = "Order created", body = CreatePayPalOrderResponse),
        (status = 400, description = "Enrollment not awaiting payment or course not purchasable"),
        (status = 404, description = "Enrollment not found")
    )
)]
pub async fn create_paypal_order(
    payment_service: web::Data<PaymentService>,
    req: HttpRequest,
    request: web::Json<CreatePayPalOrderRequest>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match payment_service
        .create_paypal_order(user.id, request.into_inner())
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
    path = "/payments/paypal/capture-order/{order_id}",
    tag = "payment",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Order captured", body = CapturePayPalOrderResponse),
        (status = 403, description = "Order belongs to another user"),
        (status = 404, description = "Order not found")
    )
)]
pub async fn capture_paypal_order(
    payment_service: web::Data<PaymentService>,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match payment_service
        .capture_paypal_order(user.id, &path.into_inner())
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
    path = "/payments/stripe/create-refund",
    tag = "payment",
    security(("bearer_auth" = [])),
    request_body = CreateRefundRequest,
    responses(
        (status = 200, description = "Refund issued", body = RefundResponse),
        (status = 400, description = "Amount exceeds the refundable remainder"),
        (status = 403, description = "Admin only")
    )
)]
pub async fn create_refund(
    payment_service: web::Data<PaymentService>,
    req: HttpRequest,
    request: web::Json<CreateRefundRequest>,
) -> Result<HttpResponse> {
    if let Err(e) = require_admin(&req) {
        return Ok(e.error_response());
    }
    match payment_service.create_refund(request.into_inner()).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    get,
    path = "/payments/history",
    tag = "payment",
    security(("bearer_auth" = [])),
    params(PaymentHistoryQuery),
    responses(
        (status = 200, description = "The caller's payments, newest first")
    )
)]
pub async fn payment_history(
    payment_service: web::Data<PaymentService>,
    req: HttpRequest,
    query: web::Query<PaymentHistoryQuery>,
) -> Result<HttpResponse> {
    let user = match current_user(&req) {
        Ok(u) => u,
        Err(e) => return Ok(e.error_response()),
    };
    match payment_service.payment_history(user.id, &query).await {
        Ok(response) => Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "data": response
        }))),
        Err(e) => Ok(e.error_response()),
    }
}

pub fn payment_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/payments")
            .route(
                "/stripe/create-payment-intent",
                web::post().to(create_stripe_payment_intent),
            )
            .route("/stripe/create-refund", web::post().to(create_refund))
            .route("/paypal/create-order", web::post().to(create_paypal_order))
            .route(
                "/paypal/capture-order/{order_id}",
                web::post().to(capture_paypal_order),
            )
            .route("/history", web::get().to(payment_history)),
    );
}
