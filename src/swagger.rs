use actix_web::web;
use utoipa::OpenApi;
use utoipa::{
    Modify,
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::entities::{
    EnrollmentStatus, PaymentGateway, PaymentStatus, PlanInterval, SubscriptionGateway,
    SubscriptionStatus,
};
use crate::handlers;
use crate::models::*;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.as_mut().unwrap();
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        )
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::refresh,
        handlers::course::list_courses,
        handlers::course::get_course,
        handlers::course::create_course,
        handlers::course::update_course,
        handlers::course::enroll,
        handlers::course::my_enrollments,
        handlers::payment::create_stripe_payment_intent,
        handlers::payment::create_paypal_order,
        handlers::payment::capture_paypal_order,
        handlers::payment::create_refund,
        handlers::payment::payment_history,
        handlers::subscription::list_plans,
        handlers::subscription::create_plan,
        handlers::subscription::update_plan,
        handlers::subscription::create_subscription,
        handlers::subscription::cancel_subscription,
        handlers::subscription::change_plan,
        handlers::subscription::my_subscription,
    ),
    components(
        schemas(
            RegisterRequest,
            LoginRequest,
            RefreshTokenRequest,
            AuthResponse,
            UserResponse,
            CreateCourseRequest,
            UpdateCourseRequest,
            CourseResponse,
            EnrollRequest,
            EnrollmentResponse,
            EnrollmentStatus,
            CreateStripePaymentIntentRequest,
            CreateStripePaymentIntentResponse,
            CreatePayPalOrderRequest,
            CreatePayPalOrderResponse,
            CapturePayPalOrderResponse,
            CreateRefundRequest,
            RefundResponse,
            RefundAttempt,
            RefundAttemptStatus,
            PaymentResponse,
            PaymentGateway,
            PaymentStatus,
            CreatePlanRequest,
            UpdatePlanRequest,
            PlanResponse,
            PlanInterval,
            CreateSubscriptionRequest,
            CreateSubscriptionResponse,
            CancelSubscriptionRequest,
            ChangePlanRequest,
            PlanChange,
            SubscriptionResponse,
            SubscriptionGateway,
            SubscriptionStatus,
            ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "auth", description = "Authentication API"),
        (name = "course", description = "Course catalog and enrollments"),
        (name = "payment", description = "Checkout and refunds"),
        (name = "subscription", description = "Plans and subscriptions"),
    ),
    info(
        title = "LMS Backend API",
        version = "1.0.0",
        description = "Course sales, subscriptions, and payment reconciliation"
    ),
    servers(
        (url = "/api/v1", description = "Local server")
    )
)]
pub struct ApiDoc;

pub fn swagger_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
    )
    .route(
        "/swagger-ui",
        web::get().to(|| async {
            actix_web::HttpResponse::Found()
                .append_header(("Location", "/swagger-ui/"))
                .finish()
        }),
    );
}
