use crate::error::AppError;
use crate::external::PayPalWebhookHeaders;
use crate::services::WebhookService;
use actix_web::{HttpRequest, HttpResponse, Result, web};
use log::{error, warn};

/// Stripe webhook处理器
///
/// 事件在验签后立即落库并确认，处理失败走本地重试队列，
/// 避免网关因非2xx响应而反复重发。
pub async fn stripe_webhook(
    req: HttpRequest,
    body: web::Bytes,
    webhook_service: web::Data<WebhookService>,
) -> Result<HttpResponse> {
    let signature = match req.headers().get("stripe-signature").and_then(|v| v.to_str().ok()) {
        Some(sig) => sig.to_string(),
        None => {
            warn!("Missing Stripe-Signature header");
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Missing Stripe-Signature header"
            })));
        }
    };

    let payload = match std::str::from_utf8(&body) {
        Ok(p) => p,
        Err(_) => {
            error!("Invalid UTF-8 in Stripe webhook payload");
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Invalid payload encoding"
            })));
        }
    };

    match webhook_service.handle_stripe(payload, &signature).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({ "received": true }))),
        Err(AppError::AuthError(msg)) => {
            warn!("Stripe webhook rejected: {msg}");
            Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Invalid signature"
            })))
        }
        Err(e) => {
            // Storage-level failure before the event reached the queue.
            // Let the gateway redeliver.
            error!("Stripe webhook not accepted: {e}");
            Ok(HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Event not accepted"
            })))
        }
    }
}

/// PayPal webhook处理器
pub async fn paypal_webhook(
    req: HttpRequest,
    body: web::Bytes,
    webhook_service: web::Data<WebhookService>,
) -> Result<HttpResponse> {
    let Some(headers) = extract_paypal_headers(&req) else {
        warn!("Missing PayPal transmission headers");
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Missing PayPal transmission headers"
        })));
    };

    let payload = match std::str::from_utf8(&body) {
        Ok(p) => p,
        Err(_) => {
            error!("Invalid UTF-8 in PayPal webhook payload");
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Invalid payload encoding"
            })));
        }
    };

    match webhook_service.handle_paypal(&headers, payload).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({ "received": true }))),
        Err(AppError::AuthError(msg)) => {
            warn!("PayPal webhook rejected: {msg}");
            Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Signature verification failed"
            })))
        }
        Err(AppError::SerdeJsonError(e)) => {
            warn!("Malformed PayPal webhook payload: {e}");
            Ok(HttpResponse::BadRequest().json(serde_json::json!({
                "error": "Malformed payload"
            })))
        }
        Err(e) => {
            error!("PayPal webhook not accepted: {e}");
            Ok(HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Event not accepted"
            })))
        }
    }
}

fn extract_paypal_headers(req: &HttpRequest) -> Option<PayPalWebhookHeaders> {
    let get = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    Some(PayPalWebhookHeaders {
        transmission_id: get("paypal-transmission-id")?,
        transmission_time: get("paypal-transmission-time")?,
        transmission_sig: get("paypal-transmission-sig")?,
        cert_url: get("paypal-cert-url")?,
        auth_algo: get("paypal-auth-algo")?,
    })
}

// Webhook路由挂在/api/v1之外
pub fn webhook_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/webhook")
            .route("/stripe", web::post().to(stripe_webhook))
            .route("/paypal", web::post().to(paypal_webhook)),
    );
}
