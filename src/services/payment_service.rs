use crate::entities::{
    EnrollmentStatus, PaymentGateway, PaymentStatus, course_entity, enrollment_entity,
    payment_entity, user_entity,
};
use crate::error::{AppError, AppResult};
use crate::external::{StripeGateway, is_already_refunded};
use crate::external::{PayPalGateway, PayPalOrder};
use crate::models::{
    CapturePayPalOrderResponse, CreatePayPalOrderRequest, CreatePayPalOrderResponse,
    CreateRefundRequest, CreateStripePaymentIntentRequest, CreateStripePaymentIntentResponse,
    PaginatedResponse, PaginationParams, PaymentHistoryQuery, PaymentResponse, RefundAttempt,
    RefundAttemptStatus, RefundResponse,
};
use crate::services::status_map::map_paypal_order_status;
use crate::utils::{amount_from_smallest_unit, amount_in_smallest_unit};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::collections::HashMap;

/// How many times a version-guarded update is retried before giving up.
const MAX_UPDATE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct PaymentService {
    pool: DatabaseConnection,
    stripe: StripeGateway,
    paypal: PayPalGateway,
    frontend_base_url: String,
}

impl PaymentService {
    pub fn new(
        pool: DatabaseConnection,
        stripe: StripeGateway,
        paypal: PayPalGateway,
        frontend_base_url: String,
    ) -> Self {
        Self {
            pool,
            stripe,
            paypal,
            frontend_base_url,
        }
    }

    // ---------- checkout ----------

    pub async fn create_stripe_payment_intent(
        &self,
        user_id: i64,
        req: CreateStripePaymentIntentRequest,
    ) -> AppResult<CreateStripePaymentIntentResponse> {
        let enrollment = self.load_pending_enrollment(user_id, req.enrollment_id).await?;
        let course = self.load_purchasable_course(enrollment.course_id).await?;

        // Re-entering checkout reuses the intent from the previous attempt
        // as long as it is still open at the gateway.
        if let Some(existing) = self.find_open_payment(&enrollment, PaymentGateway::Stripe).await?
            && let Ok(pi) = self.stripe.retrieve_payment_intent(&existing.transaction_id).await
            && pi.status != stripe::PaymentIntentStatus::Canceled
            && let Some(client_secret) = pi.client_secret
        {
            return Ok(CreateStripePaymentIntentResponse {
                payment_intent_id: existing.transaction_id,
                client_secret,
                payment_db_id: existing.id,
                amount_in_smallest_unit: existing.amount_in_smallest_unit,
                currency: existing.currency,
            });
        }

        let amount = amount_in_smallest_unit(course.price, &course.currency);
        let customer_id = self.ensure_stripe_customer(user_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("course_id".to_string(), course.id.to_string());
        metadata.insert("enrollment_id".to_string(), enrollment.id.to_string());
        metadata.insert("purpose".to_string(), "course".to_string());

        let pi = self
            .stripe
            .create_payment_intent(
                amount,
                &course.currency,
                Some(&customer_id),
                &format!("Course purchase: {}", course.title),
                metadata,
            )
            .await?;

        let client_secret = pi.client_secret.clone().unwrap_or_default();

        let payment = payment_entity::ActiveModel {
            user_id: Set(user_id),
            course_id: Set(Some(course.id)),
            enrollment_id: Set(Some(enrollment.id)),
            amount: Set(course.price),
            amount_in_smallest_unit: Set(amount),
            currency: Set(course.currency.clone()),
            payment_gateway: Set(PaymentGateway::Stripe),
            transaction_id: Set(pi.id.to_string()),
            status: Set(PaymentStatus::Pending),
            gateway_status: Set(Some(format!("{:?}", pi.status))),
            gateway_response: Set(serde_json::to_value(&pi).ok()),
            total_refunded_in_smallest_unit: Set(0),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        // The row id goes back onto the intent so webhooks can resolve the
        // ledger record without a transaction-id lookup.
        let mut backref = HashMap::new();
        backref.insert("payment_db_id".to_string(), payment.id.to_string());
        if let Err(err) = self
            .stripe
            .update_payment_intent_metadata(&pi.id.to_string(), backref)
            .await
        {
            log::warn!("Could not write payment id onto intent {}: {err}", pi.id);
        }

        log::info!(
            "Created Stripe payment intent {} for user {user_id}, enrollment {}",
            pi.id,
            enrollment.id
        );

        Ok(CreateStripePaymentIntentResponse {
            payment_intent_id: pi.id.to_string(),
            client_secret,
            payment_db_id: payment.id,
            amount_in_smallest_unit: amount,
            currency: course.currency,
        })
    }

    pub async fn create_paypal_order(
        &self,
        user_id: i64,
        req: CreatePayPalOrderRequest,
    ) -> AppResult<CreatePayPalOrderResponse> {
        let enrollment = self.load_pending_enrollment(user_id, req.enrollment_id).await?;
        let course = self.load_purchasable_course(enrollment.course_id).await?;

        let amount = amount_in_smallest_unit(course.price, &course.currency);
        let amount_str = format!(
            "{:.2}",
            amount_from_smallest_unit(amount, &course.currency)
        );

        let order = self
            .paypal
            .create_order(
                &amount_str,
                &course.currency,
                &format!("Course purchase: {}", course.title),
                &format!("enrollment:{}", enrollment.id),
                &format!("{}/payment/paypal/return", self.frontend_base_url),
                &format!("{}/payment/paypal/cancel", self.frontend_base_url),
            )
            .await?;

        let approval_link = order.approval_link();

        let payment = payment_entity::ActiveModel {
            user_id: Set(user_id),
            course_id: Set(Some(course.id)),
            enrollment_id: Set(Some(enrollment.id)),
            amount: Set(course.price),
            amount_in_smallest_unit: Set(amount),
            currency: Set(course.currency.clone()),
            payment_gateway: Set(PaymentGateway::Paypal),
            transaction_id: Set(order.id.clone()),
            status: Set(PaymentStatus::Pending),
            gateway_status: Set(Some(order.status.clone())),
            gateway_response: Set(Some(serde_json::json!({
                "id": order.id.clone(),
                "status": order.status.clone(),
                "approval_link": approval_link.clone(),
            }))),
            approval_link: Set(approval_link.clone()),
            total_refunded_in_smallest_unit: Set(0),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!(
            "Created PayPal order {} for user {user_id}, enrollment {}",
            order.id,
            enrollment.id
        );

        Ok(CreatePayPalOrderResponse {
            order_id: order.id,
            approval_link,
            payment_db_id: payment.id,
            amount_in_smallest_unit: amount,
            currency: course.currency,
        })
    }

    pub async fn capture_paypal_order(
        &self,
        user_id: i64,
        order_id: &str,
    ) -> AppResult<CapturePayPalOrderResponse> {
        let payment = self
            .find_by_transaction(PaymentGateway::Paypal, order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;
        if payment.user_id != user_id {
            return Err(AppError::Forbidden);
        }

        // Capture is idempotent on our side: an already-captured order just
        // returns the current ledger state.
        if payment.status == PaymentStatus::Succeeded {
            return Ok(CapturePayPalOrderResponse {
                enrollment_id: payment.enrollment_id,
                payment: PaymentResponse::from(payment),
            });
        }

        let order = self.paypal.capture_order(order_id).await?;
        self.apply_paypal_order_result(&order).await?;

        let payment = self
            .find_by_transaction(PaymentGateway::Paypal, order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

        Ok(CapturePayPalOrderResponse {
            enrollment_id: payment.enrollment_id,
            payment: PaymentResponse::from(payment),
        })
    }

    /// Apply the status of a PayPal order (from a capture call or webhook)
    /// to the ledger.
    pub async fn apply_paypal_order_result(&self, order: &PayPalOrder) -> AppResult<bool> {
        let Some(new_status) = map_paypal_order_status(&order.status) else {
            log::warn!(
                "Unrecognized PayPal order status '{}' for order {}, leaving ledger unchanged",
                order.status,
                order.id
            );
            return self
                .record_raw_gateway_status(PaymentGateway::Paypal, &order.id, &order.status)
                .await;
        };

        self.apply_gateway_status(
            PaymentGateway::Paypal,
            &order.id,
            None,
            new_status,
            &order.status,
            order.capture_id(),
        )
        .await
    }

    // ---------- webhook-facing transitions ----------

    pub async fn find_by_transaction(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
    ) -> AppResult<Option<payment_entity::Model>> {
        let payment = payment_entity::Entity::find()
            .filter(payment_entity::Column::PaymentGateway.eq(gateway))
            .filter(payment_entity::Column::TransactionId.eq(transaction_id))
            .one(&self.pool)
            .await?;
        Ok(payment)
    }

    /// Resolve a ledger row, preferring the local id embedded in gateway
    /// metadata over the transaction-id lookup. A hinted row whose
    /// transaction does not match is ignored.
    async fn locate_payment(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
        local_id: Option<i64>,
    ) -> AppResult<Option<payment_entity::Model>> {
        if let Some(id) = local_id
            && let Some(payment) = payment_entity::Entity::find_by_id(id).one(&self.pool).await?
            && payment.transaction_id == transaction_id
        {
            return Ok(Some(payment));
        }
        self.find_by_transaction(gateway, transaction_id).await
    }

    pub async fn find_by_capture_id(
        &self,
        capture_id: &str,
    ) -> AppResult<Option<payment_entity::Model>> {
        let payment = payment_entity::Entity::find()
            .filter(payment_entity::Column::CaptureId.eq(capture_id))
            .one(&self.pool)
            .await?;
        Ok(payment)
    }

    /// Move a payment to `new_status` if that is a forward transition,
    /// then run post-transition effects (enrollment activation). Stale or
    /// duplicate events are ignored and reported as `false`.
    ///
    /// `local_id` is the ledger row id carried in gateway metadata; when
    /// present it is tried before the transaction-id lookup.
    pub async fn apply_gateway_status(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
        local_id: Option<i64>,
        new_status: PaymentStatus,
        raw_status: &str,
        capture_id: Option<String>,
    ) -> AppResult<bool> {
        for attempt in 0..MAX_UPDATE_ATTEMPTS {
            let payment = self
                .locate_payment(gateway.clone(), transaction_id, local_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("No payment for transaction {transaction_id}"))
                })?;

            if !payment.status.can_transition(new_status) {
                if payment.status != new_status {
                    log::info!(
                        "Ignoring stale status '{raw_status}' for transaction {transaction_id} \
                         (local status: {})",
                        payment.status
                    );
                }
                // Still record what the gateway last said
                self.record_raw_gateway_status(gateway.clone(), transaction_id, raw_status)
                    .await?;
                return Ok(false);
            }

            let mut update = payment_entity::Entity::update_many()
                .filter(payment_entity::Column::Id.eq(payment.id))
                .filter(payment_entity::Column::Version.eq(payment.version))
                .col_expr(payment_entity::Column::Status, Expr::value(new_status))
                .col_expr(
                    payment_entity::Column::GatewayStatus,
                    Expr::value(Some(raw_status.to_string())),
                )
                .col_expr(
                    payment_entity::Column::Version,
                    Expr::value(payment.version + 1),
                )
                .col_expr(
                    payment_entity::Column::UpdatedAt,
                    Expr::value(Some(Utc::now())),
                );
            if let Some(ref cid) = capture_id {
                update = update.col_expr(
                    payment_entity::Column::CaptureId,
                    Expr::value(Some(cid.clone())),
                );
            }

            let result = update.exec(&self.pool).await?;
            if result.rows_affected == 0 {
                // Lost the race against a concurrent update, reload and retry
                log::debug!(
                    "Version conflict on payment {} (attempt {attempt}), retrying",
                    payment.id
                );
                continue;
            }

            log::info!(
                "Payment {} transitioned {} -> {new_status} (transaction {transaction_id})",
                payment.id,
                payment.status
            );

            if new_status == PaymentStatus::Succeeded {
                self.on_payment_succeeded(&payment).await?;
            }
            return Ok(true);
        }

        Err(AppError::Conflict(format!(
            "Payment update for transaction {transaction_id} kept conflicting"
        )))
    }

    async fn record_raw_gateway_status(
        &self,
        gateway: PaymentGateway,
        transaction_id: &str,
        raw_status: &str,
    ) -> AppResult<bool> {
        payment_entity::Entity::update_many()
            .filter(payment_entity::Column::PaymentGateway.eq(gateway))
            .filter(payment_entity::Column::TransactionId.eq(transaction_id))
            .col_expr(
                payment_entity::Column::GatewayStatus,
                Expr::value(Some(raw_status.to_string())),
            )
            .col_expr(
                payment_entity::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .exec(&self.pool)
            .await?;
        Ok(false)
    }

    /// Post-success effects: activate the course enrollment this payment
    /// paid for. Subscription payments have no per-course enrollment.
    async fn on_payment_succeeded(&self, payment: &payment_entity::Model) -> AppResult<()> {
        let enrollment_id = match payment.enrollment_id {
            Some(id) => id,
            None => {
                let Some(course_id) = payment.course_id else {
                    return Ok(());
                };
                // Ledger rows created by the reconciler may not carry the
                // enrollment link; self-heal from (user, course).
                let id = self.ensure_enrollment(payment.user_id, course_id).await?;
                payment_entity::Entity::update_many()
                    .filter(payment_entity::Column::Id.eq(payment.id))
                    .col_expr(
                        payment_entity::Column::EnrollmentId,
                        Expr::value(Some(id)),
                    )
                    .exec(&self.pool)
                    .await?;
                id
            }
        };
        self.activate_enrollment(enrollment_id, &payment.transaction_id)
            .await
    }

    /// Flip an enrollment to `active` exactly once. Idempotent: an
    /// already-active enrollment is left untouched.
    pub async fn activate_enrollment(
        &self,
        enrollment_id: i64,
        transaction_id: &str,
    ) -> AppResult<()> {
        let enrollment = enrollment_entity::Entity::find_by_id(enrollment_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Enrollment {enrollment_id} not found"))
            })?;

        if enrollment.status == EnrollmentStatus::Active {
            return Ok(());
        }

        let (user_id, course_id) = (enrollment.user_id, enrollment.course_id);
        let mut am = enrollment.into_active_model();
        am.status = Set(EnrollmentStatus::Active);
        am.payment_transaction_id = Set(Some(transaction_id.to_string()));
        am.enrolled_at = Set(Some(Utc::now()));
        am.updated_at = Set(Some(Utc::now()));
        am.update(&self.pool).await?;
        log::info!(
            "Enrollment {enrollment_id} activated for user {user_id}, course {course_id}"
        );
        Ok(())
    }

    /// Find the (user, course) enrollment, creating a pending row when the
    /// checkout that should have created it was never seen locally.
    async fn ensure_enrollment(&self, user_id: i64, course_id: i64) -> AppResult<i64> {
        let existing = enrollment_entity::Entity::find()
            .filter(enrollment_entity::Column::UserId.eq(user_id))
            .filter(enrollment_entity::Column::CourseId.eq(course_id))
            .one(&self.pool)
            .await?;
        if let Some(enrollment) = existing {
            return Ok(enrollment.id);
        }

        let enrollment = enrollment_entity::ActiveModel {
            user_id: Set(user_id),
            course_id: Set(course_id),
            status: Set(EnrollmentStatus::PendingPayment),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;
        log::info!(
            "Enrollment {} lazily created for user {user_id}, course {course_id}",
            enrollment.id
        );
        Ok(enrollment.id)
    }

    /// Insert a ledger row for a subscription charge (initial or renewal).
    /// Idempotent on (gateway, transaction_id).
    pub async fn record_subscription_payment(
        &self,
        user_id: i64,
        subscription_id: i64,
        gateway: PaymentGateway,
        transaction_id: &str,
        amount_in_smallest: i64,
        currency: &str,
        renewal_reason: Option<&str>,
    ) -> AppResult<bool> {
        if self
            .find_by_transaction(gateway.clone(), transaction_id)
            .await?
            .is_some()
        {
            return Ok(false);
        }

        payment_entity::ActiveModel {
            user_id: Set(user_id),
            subscription_id: Set(Some(subscription_id)),
            amount: Set(amount_from_smallest_unit(amount_in_smallest, currency)),
            amount_in_smallest_unit: Set(amount_in_smallest),
            currency: Set(currency.to_ascii_lowercase()),
            payment_gateway: Set(gateway),
            transaction_id: Set(transaction_id.to_string()),
            status: Set(PaymentStatus::Succeeded),
            renewal_reason: Set(renewal_reason.map(|s| s.to_string())),
            total_refunded_in_smallest_unit: Set(0),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!(
            "Recorded subscription payment {transaction_id} for subscription {subscription_id}"
        );
        Ok(true)
    }

    // ---------- refunds ----------

    pub async fn create_refund(&self, req: CreateRefundRequest) -> AppResult<RefundResponse> {
        let payment = self
            .find_by_transaction(PaymentGateway::Stripe, &req.payment_intent_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

        if !matches!(
            payment.status,
            PaymentStatus::Succeeded | PaymentStatus::PartiallyRefunded
        ) {
            return Err(AppError::Conflict(format!(
                "Payment in status '{}' cannot be refunded",
                payment.status
            )));
        }

        let remaining = payment.amount_in_smallest_unit - payment.total_refunded_in_smallest_unit;
        let requested = req.amount_in_smallest_unit.unwrap_or(remaining);
        if requested <= 0 {
            return Err(AppError::ValidationError(
                "Refund amount must be positive".to_string(),
            ));
        }
        if requested > remaining {
            return Err(AppError::ValidationError(format!(
                "Refund amount {requested} exceeds the remaining refundable {remaining}"
            )));
        }

        match self
            .stripe
            .create_refund(
                &req.payment_intent_id,
                Some(requested),
                req.reason.as_deref(),
            )
            .await
        {
            Ok(refund) => {
                let attempt = RefundAttempt {
                    refund_id: refund.id.to_string(),
                    amount_in_smallest_unit: requested,
                    status: RefundAttemptStatus::Succeeded,
                    reason: req.reason.clone(),
                    requested_at: Utc::now(),
                };
                let updated = self
                    .apply_refund_accounting(payment.id, requested, Some(attempt))
                    .await?;
                Ok(RefundResponse {
                    refund_id: refund.id.to_string(),
                    amount_in_smallest_unit: requested,
                    total_refunded_in_smallest_unit: updated.total_refunded_in_smallest_unit,
                    payment_status: updated.status,
                })
            }
            Err(err) if is_already_refunded(&err) => {
                // The gateway already refunded the full charge (e.g. from
                // the Stripe dashboard). Bring the ledger in line instead
                // of failing.
                log::warn!(
                    "Charge for {} already fully refunded at gateway, healing ledger",
                    req.payment_intent_id
                );
                let attempt = RefundAttempt {
                    refund_id: "gateway_already_refunded".to_string(),
                    amount_in_smallest_unit: remaining,
                    status: RefundAttemptStatus::Succeeded,
                    reason: Some("already refunded at gateway".to_string()),
                    requested_at: Utc::now(),
                };
                let updated = self
                    .apply_refund_accounting(payment.id, remaining, Some(attempt))
                    .await?;
                Ok(RefundResponse {
                    refund_id: "gateway_already_refunded".to_string(),
                    amount_in_smallest_unit: remaining,
                    total_refunded_in_smallest_unit: updated.total_refunded_in_smallest_unit,
                    payment_status: updated.status,
                })
            }
            Err(err) => {
                let attempt = RefundAttempt {
                    refund_id: String::new(),
                    amount_in_smallest_unit: requested,
                    status: RefundAttemptStatus::Failed,
                    reason: req.reason.clone(),
                    requested_at: Utc::now(),
                };
                // Record the failed attempt but keep totals untouched
                let _ = self.apply_refund_accounting(payment.id, 0, Some(attempt)).await;
                Err(err)
            }
        }
    }

    /// Reconcile a gateway-reported cumulative refund total (from
    /// `charge.refunded` or `PAYMENT.CAPTURE.REFUNDED`). The gateway is
    /// authoritative: the local total only ever moves up to match it.
    pub async fn apply_reported_refund_total(
        &self,
        payment_id: i64,
        reported_total: i64,
    ) -> AppResult<bool> {
        let payment = payment_entity::Entity::find_by_id(payment_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

        let delta = reported_total - payment.total_refunded_in_smallest_unit;
        if delta <= 0 {
            return Ok(false);
        }
        self.apply_refund_accounting(payment_id, delta, None).await?;
        Ok(true)
    }

    /// Version-guarded update of refund totals, the attempts array, and the
    /// derived Refunded / PartiallyRefunded status.
    async fn apply_refund_accounting(
        &self,
        payment_id: i64,
        refunded_delta: i64,
        attempt: Option<RefundAttempt>,
    ) -> AppResult<payment_entity::Model> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let payment = payment_entity::Entity::find_by_id(payment_id)
                .one(&self.pool)
                .await?
                .ok_or_else(|| AppError::NotFound("Payment not found".to_string()))?;

            let new_total = payment.total_refunded_in_smallest_unit + refunded_delta;
            let new_status = if refunded_delta == 0 {
                payment.status
            } else if new_total >= payment.amount_in_smallest_unit {
                PaymentStatus::Refunded
            } else {
                PaymentStatus::PartiallyRefunded
            };

            let mut attempts: Vec<RefundAttempt> = payment
                .refund_attempts
                .clone()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if let Some(ref a) = attempt {
                attempts.push(a.clone());
            }
            let attempts_json = serde_json::to_value(&attempts)?;

            let result = payment_entity::Entity::update_many()
                .filter(payment_entity::Column::Id.eq(payment.id))
                .filter(payment_entity::Column::Version.eq(payment.version))
                .col_expr(
                    payment_entity::Column::TotalRefundedInSmallestUnit,
                    Expr::value(new_total),
                )
                .col_expr(payment_entity::Column::Status, Expr::value(new_status))
                .col_expr(
                    payment_entity::Column::RefundAttempts,
                    Expr::value(Some(attempts_json)),
                )
                .col_expr(
                    payment_entity::Column::Version,
                    Expr::value(payment.version + 1),
                )
                .col_expr(
                    payment_entity::Column::UpdatedAt,
                    Expr::value(Some(Utc::now())),
                )
                .exec(&self.pool)
                .await?;

            if result.rows_affected > 0 {
                return payment_entity::Entity::find_by_id(payment_id)
                    .one(&self.pool)
                    .await?
                    .ok_or_else(|| AppError::NotFound("Payment not found".to_string()));
            }
        }

        Err(AppError::Conflict(format!(
            "Refund accounting for payment {payment_id} kept conflicting"
        )))
    }

    // ---------- queries ----------

    pub async fn payment_history(
        &self,
        user_id: i64,
        query: &PaymentHistoryQuery,
    ) -> AppResult<PaginatedResponse<PaymentResponse>> {
        let params = PaginationParams::new(query.page, query.per_page);

        let mut base =
            payment_entity::Entity::find().filter(payment_entity::Column::UserId.eq(user_id));
        if let Some(status) = query.status {
            base = base.filter(payment_entity::Column::Status.eq(status));
        }

        let total = base.clone().count(&self.pool).await? as i64;
        let payments = base
            .order_by_desc(payment_entity::Column::CreatedAt)
            .offset(params.get_offset() as u64)
            .limit(params.get_limit() as u64)
            .all(&self.pool)
            .await?;

        Ok(PaginatedResponse::new(
            payments.into_iter().map(PaymentResponse::from).collect(),
            params.page.unwrap_or(1),
            params.get_limit(),
            total,
        ))
    }

    // ---------- helpers ----------

    /// Load the enrollment a checkout pays for. It must belong to the
    /// caller and still be awaiting payment.
    async fn load_pending_enrollment(
        &self,
        user_id: i64,
        enrollment_id: i64,
    ) -> AppResult<enrollment_entity::Model> {
        let enrollment = enrollment_entity::Entity::find_by_id(enrollment_id)
            .one(&self.pool)
            .await?
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| AppError::NotFound("Enrollment not found".to_string()))?;

        match enrollment.status {
            EnrollmentStatus::PendingPayment => Ok(enrollment),
            EnrollmentStatus::Active | EnrollmentStatus::Completed => Err(AppError::Conflict(
                "Enrollment is already paid for".to_string(),
            )),
            EnrollmentStatus::Cancelled => Err(AppError::Conflict(
                "Enrollment has been cancelled".to_string(),
            )),
        }
    }

    async fn load_purchasable_course(&self, course_id: i64) -> AppResult<course_entity::Model> {
        let course = course_entity::Entity::find_by_id(course_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Course not found".to_string()))?;
        if !course.is_published {
            return Err(AppError::ValidationError(
                "Course is not available for purchase".to_string(),
            ));
        }
        if course.price <= 0.0 {
            return Err(AppError::ValidationError(
                "Course price must be positive".to_string(),
            ));
        }
        Ok(course)
    }

    /// Most recent non-terminal checkout payment for an enrollment, if any.
    async fn find_open_payment(
        &self,
        enrollment: &enrollment_entity::Model,
        gateway: PaymentGateway,
    ) -> AppResult<Option<payment_entity::Model>> {
        let payment = payment_entity::Entity::find()
            .filter(payment_entity::Column::EnrollmentId.eq(enrollment.id))
            .filter(payment_entity::Column::PaymentGateway.eq(gateway))
            .filter(payment_entity::Column::Status.is_in([
                PaymentStatus::Pending,
                PaymentStatus::RequiresAction,
                PaymentStatus::Processing,
            ]))
            .order_by_desc(payment_entity::Column::CreatedAt)
            .one(&self.pool)
            .await?;
        Ok(payment)
    }

    /// Find the user's Stripe customer id, creating the customer on first
    /// use and persisting the id.
    async fn ensure_stripe_customer(&self, user_id: i64) -> AppResult<String> {
        let user = user_entity::Entity::find_by_id(user_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        if let Some(cid) = user.stripe_customer_id.clone() {
            return Ok(cid);
        }

        let customer = self.stripe.create_customer(&user.email, &user.name).await?;
        let cid = customer.id.to_string();

        let mut am = user.into_active_model();
        am.stripe_customer_id = Set(Some(cid.clone()));
        am.updated_at = Set(Some(Utc::now()));
        am.update(&self.pool).await?;

        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PayPalConfig, StripeConfig};
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_service() -> (PaymentService, DatabaseConnection) {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&pool, None).await.unwrap();
        let stripe = StripeGateway::new(StripeConfig {
            secret_key: String::new(),
            webhook_secret: String::new(),
        });
        let paypal = PayPalGateway::new(PayPalConfig {
            client_id: String::new(),
            client_secret: String::new(),
            base_url: "https://api-m.sandbox.paypal.com".to_string(),
            webhook_id: String::new(),
            brand_name: "LMS".to_string(),
        });
        let svc = PaymentService::new(
            pool.clone(),
            stripe,
            paypal,
            "http://localhost:3000".to_string(),
        );
        (svc, pool)
    }

    async fn seed_payment(
        pool: &DatabaseConnection,
        gateway: PaymentGateway,
        transaction_id: &str,
        amount: i64,
        status: PaymentStatus,
        course_id: Option<i64>,
    ) -> payment_entity::Model {
        payment_entity::ActiveModel {
            user_id: Set(1),
            course_id: Set(course_id),
            amount: Set(amount as f64 / 100.0),
            amount_in_smallest_unit: Set(amount),
            currency: Set("usd".to_string()),
            payment_gateway: Set(gateway),
            transaction_id: Set(transaction_id.to_string()),
            status: Set(status),
            total_refunded_in_smallest_unit: Set(0),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_transition_activates_enrollment() {
        let (svc, pool) = test_service().await;
        seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_1",
            4999,
            PaymentStatus::Pending,
            Some(7),
        )
        .await;

        let moved = svc
            .apply_gateway_status(
                PaymentGateway::Stripe,
                "pi_1",
                None,
                PaymentStatus::Succeeded,
                "succeeded",
                None,
            )
            .await
            .unwrap();
        assert!(moved);

        let payment = svc
            .find_by_transaction(PaymentGateway::Stripe, "pi_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.version, 1);

        let enrollment = enrollment_entity::Entity::find_by_id(payment.enrollment_id.unwrap())
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert_eq!(enrollment.payment_transaction_id.as_deref(), Some("pi_1"));
    }

    #[tokio::test]
    async fn test_stale_event_does_not_move_ledger_backwards() {
        let (svc, pool) = test_service().await;
        seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_2",
            4999,
            PaymentStatus::Succeeded,
            Some(7),
        )
        .await;

        let moved = svc
            .apply_gateway_status(
                PaymentGateway::Stripe,
                "pi_2",
                None,
                PaymentStatus::Processing,
                "processing",
                None,
            )
            .await
            .unwrap();
        assert!(!moved);

        let payment = svc
            .find_by_transaction(PaymentGateway::Stripe, "pi_2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        // The raw gateway string is still recorded for audit
        assert_eq!(payment.gateway_status.as_deref(), Some("processing"));
    }

    #[tokio::test]
    async fn test_duplicate_success_event_is_idempotent() {
        let (svc, pool) = test_service().await;
        seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_3",
            4999,
            PaymentStatus::Pending,
            Some(9),
        )
        .await;

        for _ in 0..2 {
            svc.apply_gateway_status(
                PaymentGateway::Stripe,
                "pi_3",
                None,
                PaymentStatus::Succeeded,
                "succeeded",
                None,
            )
            .await
            .unwrap();
        }

        let enrollments = enrollment_entity::Entity::find()
            .filter(enrollment_entity::Column::UserId.eq(1))
            .filter(enrollment_entity::Column::CourseId.eq(9))
            .all(&pool)
            .await
            .unwrap();
        assert_eq!(enrollments.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_refund_accounting() {
        let (svc, pool) = test_service().await;
        // $50 payment
        let payment = seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_4",
            5000,
            PaymentStatus::Succeeded,
            None,
        )
        .await;

        // $20 refund
        let updated = svc
            .apply_refund_accounting(
                payment.id,
                2000,
                Some(RefundAttempt {
                    refund_id: "re_1".to_string(),
                    amount_in_smallest_unit: 2000,
                    status: RefundAttemptStatus::Succeeded,
                    reason: None,
                    requested_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(updated.total_refunded_in_smallest_unit, 2000);

        // remaining $30 refund completes the payment
        let updated = svc
            .apply_refund_accounting(
                payment.id,
                3000,
                Some(RefundAttempt {
                    refund_id: "re_2".to_string(),
                    amount_in_smallest_unit: 3000,
                    status: RefundAttemptStatus::Succeeded,
                    reason: None,
                    requested_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, PaymentStatus::Refunded);
        assert_eq!(updated.total_refunded_in_smallest_unit, 5000);

        let attempts: Vec<RefundAttempt> =
            serde_json::from_value(updated.refund_attempts.unwrap()).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].refund_id, "re_1");
    }

    #[tokio::test]
    async fn test_reported_refund_total_only_moves_up() {
        let (svc, pool) = test_service().await;
        let payment = seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_5",
            5000,
            PaymentStatus::Succeeded,
            None,
        )
        .await;

        assert!(svc.apply_reported_refund_total(payment.id, 2000).await.unwrap());
        // Redelivered webhook with the same cumulative total is a no-op
        assert!(!svc.apply_reported_refund_total(payment.id, 2000).await.unwrap());
        // A lower (stale) total is also a no-op
        assert!(!svc.apply_reported_refund_total(payment.id, 1000).await.unwrap());

        let reloaded = payment_entity::Entity::find_by_id(payment.id)
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.total_refunded_in_smallest_unit, 2000);
        assert_eq!(reloaded.status, PaymentStatus::PartiallyRefunded);
    }

    #[tokio::test]
    async fn test_linked_pending_enrollment_is_activated() {
        let (svc, pool) = test_service().await;
        let enrollment = enrollment_entity::ActiveModel {
            user_id: Set(1),
            course_id: Set(3),
            status: Set(EnrollmentStatus::PendingPayment),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        let payment = seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_6",
            4999,
            PaymentStatus::Pending,
            Some(3),
        )
        .await;
        let payment_id = payment.id;
        let mut am = payment.into_active_model();
        am.enrollment_id = Set(Some(enrollment.id));
        am.update(&pool).await.unwrap();

        // Resolution prefers the metadata-carried ledger id
        svc.apply_gateway_status(
            PaymentGateway::Stripe,
            "pi_6",
            Some(payment_id),
            PaymentStatus::Succeeded,
            "succeeded",
            None,
        )
        .await
        .unwrap();

        let reloaded = enrollment_entity::Entity::find_by_id(enrollment.id)
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, EnrollmentStatus::Active);
        assert_eq!(reloaded.payment_transaction_id.as_deref(), Some("pi_6"));
    }

    #[tokio::test]
    async fn test_activate_enrollment_is_idempotent() {
        let (svc, pool) = test_service().await;
        let enrollment = enrollment_entity::ActiveModel {
            user_id: Set(1),
            course_id: Set(3),
            status: Set(EnrollmentStatus::PendingPayment),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        svc.activate_enrollment(enrollment.id, "pi_7").await.unwrap();
        svc.activate_enrollment(enrollment.id, "pi_other").await.unwrap();

        let reloaded = enrollment_entity::Entity::find_by_id(enrollment.id)
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, EnrollmentStatus::Active);
        // The second call did not overwrite the activating transaction
        assert_eq!(reloaded.payment_transaction_id.as_deref(), Some("pi_7"));
    }

    #[tokio::test]
    async fn test_version_guard_blocks_stale_writers() {
        let (svc, pool) = test_service().await;
        let payment = seed_payment(
            &pool,
            PaymentGateway::Stripe,
            "pi_8",
            4999,
            PaymentStatus::Pending,
            None,
        )
        .await;

        // Another worker moves the row first, consuming version 0
        svc.apply_gateway_status(
            PaymentGateway::Stripe,
            "pi_8",
            None,
            PaymentStatus::Processing,
            "processing",
            None,
        )
        .await
        .unwrap();

        // A writer still holding version 0 touches nothing
        let stale = payment_entity::Entity::update_many()
            .filter(payment_entity::Column::Id.eq(payment.id))
            .filter(payment_entity::Column::Version.eq(payment.version))
            .col_expr(
                payment_entity::Column::Status,
                Expr::value(PaymentStatus::Failed),
            )
            .exec(&pool)
            .await
            .unwrap();
        assert_eq!(stale.rows_affected, 0);

        // The service re-reads and converges from the current version
        svc.apply_gateway_status(
            PaymentGateway::Stripe,
            "pi_8",
            None,
            PaymentStatus::Succeeded,
            "succeeded",
            None,
        )
        .await
        .unwrap();

        let reloaded = payment_entity::Entity::find_by_id(payment.id)
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.status, PaymentStatus::Succeeded);
        assert_eq!(reloaded.version, 2);
    }

    #[tokio::test]
    async fn test_subscription_payment_recording_is_idempotent() {
        let (svc, _pool) = test_service().await;
        let first = svc
            .record_subscription_payment(
                1,
                10,
                PaymentGateway::Stripe,
                "pi_renewal_1",
                999,
                "usd",
                Some("subscription_cycle"),
            )
            .await
            .unwrap();
        let second = svc
            .record_subscription_payment(
                1,
                10,
                PaymentGateway::Stripe,
                "pi_renewal_1",
                999,
                "usd",
                Some("subscription_cycle"),
            )
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }
}
