use crate::entities::{PaymentGateway, PaymentStatus, WebhookEventStatus, webhook_event_entity};
use crate::error::{AppError, AppResult};
use crate::external::{
    PayPalCaptureResource, PayPalGateway, PayPalOrder, PayPalRefundResource, PayPalSale,
    PayPalSubscription, PayPalWebhookEvent, PayPalWebhookHeaders, StripeGateway,
};
use crate::services::payment_service::PaymentService;
use crate::services::status_map::map_stripe_payment_intent_status;
use crate::services::subscription_service::{StripeSubscriptionSnapshot, SubscriptionService};
use crate::utils::amount_in_smallest_unit;
use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use stripe::{Event, EventObject, EventType, Expandable};

/// Deliveries that keep failing are parked after this many attempts and
/// need operator attention.
const MAX_DELIVERY_ATTEMPTS: i32 = 5;

const RETRY_BASE_SECS: i64 = 60;

/// Gateways treat any non-2xx as "retry later" and will hammer a failing
/// endpoint. Every event is therefore stored and acknowledged first, and
/// processing failures go to a local retry queue instead of bubbling into
/// the HTTP status. The only exception is signature verification: a bad
/// signature is rejected outright so forged payloads never enter the queue.
#[derive(Clone)]
pub struct WebhookService {
    pool: DatabaseConnection,
    stripe: StripeGateway,
    paypal: PayPalGateway,
    payments: PaymentService,
    subscriptions: SubscriptionService,
}

enum Ingest {
    Fresh(webhook_event_entity::Model),
    Duplicate,
}

impl WebhookService {
    pub fn new(
        pool: DatabaseConnection,
        stripe: StripeGateway,
        paypal: PayPalGateway,
        payments: PaymentService,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            pool,
            stripe,
            paypal,
            payments,
            subscriptions,
        }
    }

    // ---------- entry points ----------

    pub async fn handle_stripe(&self, payload: &str, signature: &str) -> AppResult<()> {
        let event = self.stripe.construct_event(payload, signature)?;
        let event_id = event.id.to_string();
        let event_type = format!("{:?}", event.type_);

        let row = match self
            .record_event(
                PaymentGateway::Stripe,
                &event_id,
                &event_type,
                serde_json::to_value(&event)?,
            )
            .await?
        {
            Ingest::Fresh(row) => row,
            Ingest::Duplicate => {
                log::info!("Duplicate Stripe event {event_id}, skipping");
                return Ok(());
            }
        };

        match self.process_stripe_event(&event).await {
            Ok(outcome) => self.mark_processed(row, outcome).await,
            Err(err) => self.mark_failed(row, &err).await,
        }
    }

    pub async fn handle_paypal(
        &self,
        headers: &PayPalWebhookHeaders,
        body: &str,
    ) -> AppResult<()> {
        let payload: serde_json::Value = serde_json::from_str(body)?;
        if !self.paypal.verify_webhook_signature(headers, &payload).await? {
            return Err(AppError::AuthError(
                "PayPal webhook signature verification failed".to_string(),
            ));
        }

        let event: PayPalWebhookEvent = serde_json::from_value(payload.clone())?;
        let row = match self
            .record_event(
                PaymentGateway::Paypal,
                &event.id,
                &event.event_type,
                payload,
            )
            .await?
        {
            Ingest::Fresh(row) => row,
            Ingest::Duplicate => {
                log::info!("Duplicate PayPal event {}, skipping", event.id);
                return Ok(());
            }
        };

        match self.process_paypal_event(&event).await {
            Ok(outcome) => self.mark_processed(row, outcome).await,
            Err(err) => self.mark_failed(row, &err).await,
        }
    }

    // ---------- event log ----------

    async fn record_event(
        &self,
        gateway: PaymentGateway,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> AppResult<Ingest> {
        let existing = webhook_event_entity::Entity::find()
            .filter(webhook_event_entity::Column::Gateway.eq(gateway.clone()))
            .filter(webhook_event_entity::Column::EventId.eq(event_id))
            .one(&self.pool)
            .await?;

        match existing {
            Some(row)
                if matches!(
                    row.status,
                    WebhookEventStatus::Processed | WebhookEventStatus::Ignored
                ) =>
            {
                Ok(Ingest::Duplicate)
            }
            // A redelivery of an event that previously failed gets another
            // chance right away.
            Some(row) => Ok(Ingest::Fresh(row)),
            None => {
                let row = webhook_event_entity::ActiveModel {
                    gateway: Set(gateway),
                    event_id: Set(event_id.to_string()),
                    event_type: Set(event_type.to_string()),
                    status: Set(WebhookEventStatus::Received),
                    payload: Set(payload),
                    attempt_count: Set(0),
                    created_at: Set(Some(Utc::now())),
                    updated_at: Set(Some(Utc::now())),
                    ..Default::default()
                }
                .insert(&self.pool)
                .await?;
                Ok(Ingest::Fresh(row))
            }
        }
    }

    async fn mark_processed(
        &self,
        row: webhook_event_entity::Model,
        outcome: WebhookEventStatus,
    ) -> AppResult<()> {
        let mut am = row.into_active_model();
        am.status = Set(outcome);
        am.processed_at = Set(Some(Utc::now()));
        am.last_error = Set(None);
        am.next_retry_at = Set(None);
        am.updated_at = Set(Some(Utc::now()));
        am.update(&self.pool).await?;
        Ok(())
    }

    async fn mark_failed(&self, row: webhook_event_entity::Model, err: &AppError) -> AppResult<()> {
        let attempts = row.attempt_count + 1;
        let next_retry = if attempts < MAX_DELIVERY_ATTEMPTS {
            let delay = RETRY_BASE_SECS * (1 << attempts.min(6));
            Some(Utc::now() + Duration::seconds(delay))
        } else {
            log::error!(
                "Webhook event {} gave up after {attempts} attempts: {err}",
                row.event_id
            );
            None
        };
        log::warn!(
            "Webhook event {} failed (attempt {attempts}): {err}",
            row.event_id
        );

        let mut am = row.into_active_model();
        am.status = Set(WebhookEventStatus::Failed);
        am.attempt_count = Set(attempts);
        am.last_error = Set(Some(err.to_string()));
        am.next_retry_at = Set(next_retry);
        am.updated_at = Set(Some(Utc::now()));
        am.update(&self.pool).await?;
        Ok(())
    }

    /// Re-run failed events whose backoff has elapsed. Called from the
    /// periodic sweep task.
    pub async fn process_due_retries(&self) -> AppResult<u64> {
        let now = Utc::now();
        let due = webhook_event_entity::Entity::find()
            .filter(webhook_event_entity::Column::Status.eq(WebhookEventStatus::Failed))
            .filter(webhook_event_entity::Column::AttemptCount.lt(MAX_DELIVERY_ATTEMPTS))
            .filter(webhook_event_entity::Column::NextRetryAt.lte(now))
            .order_by_asc(webhook_event_entity::Column::NextRetryAt)
            .all(&self.pool)
            .await?;

        let mut processed = 0u64;
        for row in due {
            log::info!(
                "Retrying webhook event {} (attempt {})",
                row.event_id,
                row.attempt_count + 1
            );
            let outcome = match row.gateway {
                PaymentGateway::Stripe => {
                    match serde_json::from_value::<Event>(row.payload.clone()) {
                        Ok(event) => self.process_stripe_event(&event).await,
                        Err(e) => Err(AppError::from(e)),
                    }
                }
                PaymentGateway::Paypal => {
                    match serde_json::from_value::<PayPalWebhookEvent>(row.payload.clone()) {
                        Ok(event) => self.process_paypal_event(&event).await,
                        Err(e) => Err(AppError::from(e)),
                    }
                }
                PaymentGateway::Other => Ok(WebhookEventStatus::Ignored),
            };
            match outcome {
                Ok(status) => {
                    self.mark_processed(row, status).await?;
                    processed += 1;
                }
                Err(err) => self.mark_failed(row, &err).await?,
            }
        }
        Ok(processed)
    }

    // ---------- Stripe dispatch ----------

    pub async fn process_stripe_event(&self, event: &Event) -> AppResult<WebhookEventStatus> {
        match event.type_ {
            EventType::PaymentIntentSucceeded
            | EventType::PaymentIntentProcessing
            | EventType::PaymentIntentRequiresAction
            | EventType::PaymentIntentCanceled => {
                let EventObject::PaymentIntent(pi) = event.data.object.clone() else {
                    return Ok(WebhookEventStatus::Ignored);
                };
                let status = map_stripe_payment_intent_status(pi.status);
                self.apply_stripe_payment_status(
                    &pi.id.to_string(),
                    payment_db_id_hint(&pi.metadata),
                    status,
                    &format!("{:?}", pi.status),
                )
                .await
            }
            EventType::PaymentIntentPaymentFailed => {
                let EventObject::PaymentIntent(pi) = event.data.object.clone() else {
                    return Ok(WebhookEventStatus::Ignored);
                };
                // The intent itself rolls back to requires_payment_method;
                // the event is what tells us the attempt failed.
                self.apply_stripe_payment_status(
                    &pi.id.to_string(),
                    payment_db_id_hint(&pi.metadata),
                    PaymentStatus::Failed,
                    &format!("{:?}", pi.status),
                )
                .await
            }
            EventType::ChargeRefunded => {
                let EventObject::Charge(charge) = event.data.object.clone() else {
                    return Ok(WebhookEventStatus::Ignored);
                };
                let Some(pi_id) = charge.payment_intent.as_ref().map(expandable_id) else {
                    log::warn!("Refunded charge {} has no payment intent", charge.id);
                    return Ok(WebhookEventStatus::Ignored);
                };
                let Some(payment) = self
                    .payments
                    .find_by_transaction(PaymentGateway::Stripe, &pi_id)
                    .await?
                else {
                    log::warn!("No local payment for refunded intent {pi_id}");
                    return Ok(WebhookEventStatus::Ignored);
                };
                self.payments
                    .apply_reported_refund_total(payment.id, charge.amount_refunded)
                    .await?;
                Ok(WebhookEventStatus::Processed)
            }
            EventType::InvoicePaymentSucceeded => {
                let EventObject::Invoice(invoice) = event.data.object.clone() else {
                    return Ok(WebhookEventStatus::Ignored);
                };
                let Some(sub_id) = invoice.subscription.as_ref().map(expandable_id) else {
                    // One-off invoices are not ours
                    return Ok(WebhookEventStatus::Ignored);
                };
                let Some(row) = self
                    .subscriptions
                    .find_by_stripe_subscription_id(&sub_id)
                    .await?
                else {
                    log::warn!("Paid invoice for unknown subscription {sub_id}");
                    return Ok(WebhookEventStatus::Ignored);
                };

                let transaction_id = invoice
                    .payment_intent
                    .as_ref()
                    .map(expandable_id)
                    .unwrap_or_else(|| invoice.id.to_string());
                let amount = invoice.amount_paid.unwrap_or(0);
                let currency = invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "usd".to_string());
                let reason = invoice.billing_reason.map(|r| format!("{r:?}"));

                self.payments
                    .record_subscription_payment(
                        row.user_id,
                        row.id,
                        PaymentGateway::Stripe,
                        &transaction_id,
                        amount,
                        &currency,
                        reason.as_deref(),
                    )
                    .await?;
                Ok(WebhookEventStatus::Processed)
            }
            EventType::CustomerSubscriptionCreated
            | EventType::CustomerSubscriptionUpdated
            | EventType::CustomerSubscriptionDeleted => {
                let EventObject::Subscription(sub) = event.data.object.clone() else {
                    return Ok(WebhookEventStatus::Ignored);
                };
                let snapshot = StripeSubscriptionSnapshot::from_subscription(&sub);
                self.subscriptions.apply_stripe_snapshot(&snapshot).await?;
                Ok(WebhookEventStatus::Processed)
            }
            _ => {
                log::info!("Unhandled Stripe event type: {:?}", event.type_);
                Ok(WebhookEventStatus::Ignored)
            }
        }
    }

    async fn apply_stripe_payment_status(
        &self,
        payment_intent_id: &str,
        local_id: Option<i64>,
        status: PaymentStatus,
        raw_status: &str,
    ) -> AppResult<WebhookEventStatus> {
        match self
            .payments
            .apply_gateway_status(
                PaymentGateway::Stripe,
                payment_intent_id,
                local_id,
                status,
                raw_status,
                None,
            )
            .await
        {
            Ok(_) => Ok(WebhookEventStatus::Processed),
            // Intents created outside this backend show up here too
            Err(AppError::NotFound(_)) => {
                log::warn!("No local payment for intent {payment_intent_id}");
                Ok(WebhookEventStatus::Ignored)
            }
            Err(err) => Err(err),
        }
    }

    // ---------- PayPal dispatch ----------

    pub async fn process_paypal_event(
        &self,
        event: &PayPalWebhookEvent,
    ) -> AppResult<WebhookEventStatus> {
        match event.event_type.as_str() {
            "CHECKOUT.ORDER.APPROVED" => {
                let order: PayPalOrder = serde_json::from_value(event.resource.clone())?;
                self.payments.apply_paypal_order_result(&order).await?;
                Ok(WebhookEventStatus::Processed)
            }
            "PAYMENT.CAPTURE.COMPLETED" => {
                let capture: PayPalCaptureResource =
                    serde_json::from_value(event.resource.clone())?;
                let Some(order_id) = capture
                    .supplementary_data
                    .as_ref()
                    .and_then(|s| s.related_ids.as_ref())
                    .and_then(|r| r.order_id.clone())
                else {
                    log::warn!("Capture {} carries no order id", capture.id);
                    return Ok(WebhookEventStatus::Ignored);
                };
                match self
                    .payments
                    .apply_gateway_status(
                        PaymentGateway::Paypal,
                        &order_id,
                        None,
                        PaymentStatus::Succeeded,
                        capture.status.as_deref().unwrap_or("COMPLETED"),
                        Some(capture.id.clone()),
                    )
                    .await
                {
                    Ok(_) => Ok(WebhookEventStatus::Processed),
                    Err(AppError::NotFound(_)) => {
                        log::warn!("No local payment for PayPal order {order_id}");
                        Ok(WebhookEventStatus::Ignored)
                    }
                    Err(err) => Err(err),
                }
            }
            "PAYMENT.CAPTURE.REFUNDED" => {
                let refund: PayPalRefundResource = serde_json::from_value(event.resource.clone())?;
                let Some(capture_id) = refund.capture_id() else {
                    log::warn!("Refund {} carries no capture link", refund.id);
                    return Ok(WebhookEventStatus::Ignored);
                };
                let Some(payment) = self.payments.find_by_capture_id(&capture_id).await? else {
                    log::warn!("No local payment for refunded capture {capture_id}");
                    return Ok(WebhookEventStatus::Ignored);
                };

                let total = refund
                    .seller_payable_breakdown
                    .as_ref()
                    .and_then(|b| b.total_refunded_amount.as_ref())
                    .or(refund.amount.as_ref())
                    .and_then(|a| {
                        a.value
                            .parse::<f64>()
                            .ok()
                            .map(|v| amount_in_smallest_unit(v, &a.currency_code))
                    });
                let Some(total) = total else {
                    log::warn!("Refund {} carries no usable amount", refund.id);
                    return Ok(WebhookEventStatus::Ignored);
                };

                self.payments
                    .apply_reported_refund_total(payment.id, total)
                    .await?;
                Ok(WebhookEventStatus::Processed)
            }
            "PAYMENT.SALE.COMPLETED" => {
                let sale: PayPalSale = serde_json::from_value(event.resource.clone())?;
                let Some(sub_id) = sale.billing_agreement_id.clone() else {
                    return Ok(WebhookEventStatus::Ignored);
                };
                let Some(row) = self
                    .subscriptions
                    .find_by_paypal_subscription_id(&sub_id)
                    .await?
                else {
                    log::warn!("Sale for unknown PayPal subscription {sub_id}");
                    return Ok(WebhookEventStatus::Ignored);
                };

                let amount = sale
                    .amount
                    .as_ref()
                    .and_then(|a| a.total.parse::<f64>().ok())
                    .map(|v| {
                        let currency = sale
                            .amount
                            .as_ref()
                            .map(|a| a.currency.as_str())
                            .unwrap_or("USD");
                        (amount_in_smallest_unit(v, currency), currency.to_string())
                    });
                let (amount, currency) = amount.unwrap_or((0, "USD".to_string()));

                self.payments
                    .record_subscription_payment(
                        row.user_id,
                        row.id,
                        PaymentGateway::Paypal,
                        &sale.id,
                        amount,
                        &currency,
                        Some("subscription_cycle"),
                    )
                    .await?;

                // Best effort: pull the subscription for fresh period dates.
                match self.paypal.get_subscription(&sub_id).await {
                    Ok(sub) => {
                        self.subscriptions.apply_paypal_subscription(&sub).await?;
                    }
                    Err(err) => {
                        log::warn!("Could not refresh PayPal subscription {sub_id}: {err}");
                    }
                }
                Ok(WebhookEventStatus::Processed)
            }
            "BILLING.SUBSCRIPTION.ACTIVATED"
            | "BILLING.SUBSCRIPTION.UPDATED"
            | "BILLING.SUBSCRIPTION.SUSPENDED"
            | "BILLING.SUBSCRIPTION.CANCELLED"
            | "BILLING.SUBSCRIPTION.EXPIRED"
            | "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => {
                let sub: PayPalSubscription = serde_json::from_value(event.resource.clone())?;
                self.subscriptions.apply_paypal_subscription(&sub).await?;
                Ok(WebhookEventStatus::Processed)
            }
            other => {
                log::info!("Unhandled PayPal event type: {other}");
                Ok(WebhookEventStatus::Ignored)
            }
        }
    }
}

/// Ledger row id written into the intent's metadata at checkout.
fn payment_db_id_hint(metadata: &std::collections::HashMap<String, String>) -> Option<i64> {
    metadata.get("payment_db_id").and_then(|v| v.parse().ok())
}

fn expandable_id<T: stripe::Object>(exp: &Expandable<T>) -> String
where
    T::Id: ToString,
{
    match exp {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(obj) => obj.id().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PayPalConfig, StripeConfig};
    use crate::entities::{
        EnrollmentStatus, SubscriptionGateway, SubscriptionStatus, enrollment_entity,
        payment_entity, user_subscription_entity,
    };
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_service() -> (WebhookService, DatabaseConnection) {
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
        let payments = PaymentService::new(
            pool.clone(),
            stripe.clone(),
            paypal.clone(),
            "http://localhost:3000".to_string(),
        );
        let subscriptions = SubscriptionService::new(
            pool.clone(),
            stripe.clone(),
            paypal.clone(),
            "http://localhost:3000".to_string(),
        );
        let svc = WebhookService::new(pool.clone(), stripe, paypal, payments, subscriptions);
        (svc, pool)
    }

    fn paypal_event(id: &str, event_type: &str, resource: serde_json::Value) -> PayPalWebhookEvent {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "event_type": event_type,
            "resource": resource,
            "create_time": "2026-08-01T00:00:00Z",
        }))
        .unwrap()
    }

    async fn seed_paypal_payment(pool: &DatabaseConnection, order_id: &str) {
        payment_entity::ActiveModel {
            user_id: Set(1),
            course_id: Set(Some(5)),
            amount: Set(49.99),
            amount_in_smallest_unit: Set(4999),
            currency: Set("usd".to_string()),
            payment_gateway: Set(PaymentGateway::Paypal),
            transaction_id: Set(order_id.to_string()),
            status: Set(PaymentStatus::Pending),
            total_refunded_in_smallest_unit: Set(0),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_capture_completed_settles_payment_and_enrolls() {
        let (svc, pool) = test_service().await;
        seed_paypal_payment(&pool, "ORDER-1").await;

        let event = paypal_event(
            "WH-1",
            "PAYMENT.CAPTURE.COMPLETED",
            serde_json::json!({
                "id": "CAP-1",
                "status": "COMPLETED",
                "amount": {"currency_code": "USD", "value": "49.99"},
                "supplementary_data": {"related_ids": {"order_id": "ORDER-1"}},
            }),
        );
        let outcome = svc.process_paypal_event(&event).await.unwrap();
        assert_eq!(outcome, WebhookEventStatus::Processed);

        let payment = payment_entity::Entity::find()
            .filter(payment_entity::Column::TransactionId.eq("ORDER-1"))
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.capture_id.as_deref(), Some("CAP-1"));

        let enrollment = enrollment_entity::Entity::find()
            .filter(enrollment_entity::Column::UserId.eq(1))
            .filter(enrollment_entity::Column::CourseId.eq(5))
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
    }

    #[tokio::test]
    async fn test_order_approved_after_capture_is_stale() {
        let (svc, pool) = test_service().await;
        seed_paypal_payment(&pool, "ORDER-2").await;

        let completed = paypal_event(
            "WH-2a",
            "PAYMENT.CAPTURE.COMPLETED",
            serde_json::json!({
                "id": "CAP-2",
                "status": "COMPLETED",
                "supplementary_data": {"related_ids": {"order_id": "ORDER-2"}},
            }),
        );
        svc.process_paypal_event(&completed).await.unwrap();

        // The APPROVED event arrives late; the ledger must not move back.
        let approved = paypal_event(
            "WH-2b",
            "CHECKOUT.ORDER.APPROVED",
            serde_json::json!({
                "id": "ORDER-2",
                "status": "APPROVED",
                "purchase_units": [],
            }),
        );
        svc.process_paypal_event(&approved).await.unwrap();

        let payment = payment_entity::Entity::find()
            .filter(payment_entity::Column::TransactionId.eq("ORDER-2"))
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_capture_refund_updates_totals() {
        let (svc, pool) = test_service().await;
        seed_paypal_payment(&pool, "ORDER-3").await;

        let completed = paypal_event(
            "WH-3a",
            "PAYMENT.CAPTURE.COMPLETED",
            serde_json::json!({
                "id": "CAP-3",
                "status": "COMPLETED",
                "supplementary_data": {"related_ids": {"order_id": "ORDER-3"}},
            }),
        );
        svc.process_paypal_event(&completed).await.unwrap();

        let refunded = paypal_event(
            "WH-3b",
            "PAYMENT.CAPTURE.REFUNDED",
            serde_json::json!({
                "id": "REF-1",
                "status": "COMPLETED",
                "amount": {"currency_code": "USD", "value": "20.00"},
                "seller_payable_breakdown": {
                    "total_refunded_amount": {"currency_code": "USD", "value": "20.00"}
                },
                "links": [
                    {"rel": "up", "href": "https://api.paypal.com/v2/payments/captures/CAP-3"}
                ],
            }),
        );
        let outcome = svc.process_paypal_event(&refunded).await.unwrap();
        assert_eq!(outcome, WebhookEventStatus::Processed);

        let payment = payment_entity::Entity::find()
            .filter(payment_entity::Column::TransactionId.eq("ORDER-3"))
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(payment.total_refunded_in_smallest_unit, 2000);
    }

    #[tokio::test]
    async fn test_subscription_activated_event_is_idempotent() {
        let (svc, pool) = test_service().await;

        let resource = serde_json::json!({
            "id": "I-XYZ",
            "status": "ACTIVE",
            "plan_id": "P-1",
            "custom_id": "user:3:plan:2",
            "billing_info": {
                "next_billing_time": "2026-10-01T00:00:00Z",
                "cycle_executions": [
                    {"tenure_type": "REGULAR", "cycles_completed": 1, "cycles_remaining": 0, "total_cycles": 0}
                ]
            }
        });
        let event = paypal_event("WH-4", "BILLING.SUBSCRIPTION.ACTIVATED", resource);

        svc.process_paypal_event(&event).await.unwrap();
        svc.process_paypal_event(&event).await.unwrap();

        let rows = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::PaypalSubscriptionId.eq("I-XYZ"))
            .all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SubscriptionStatus::Active);
        assert_eq!(rows[0].gateway, SubscriptionGateway::Paypal);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_ignored() {
        let (svc, _pool) = test_service().await;
        let event = paypal_event(
            "WH-5",
            "CUSTOMER.DISPUTE.CREATED",
            serde_json::json!({"id": "D-1"}),
        );
        let outcome = svc.process_paypal_event(&event).await.unwrap();
        assert_eq!(outcome, WebhookEventStatus::Ignored);
    }

    #[tokio::test]
    async fn test_redelivered_event_is_recorded_once() {
        let (svc, pool) = test_service().await;
        let payload = serde_json::json!({"id": "WH-8"});

        let first = svc
            .record_event(
                PaymentGateway::Paypal,
                "WH-8",
                "PAYMENT.CAPTURE.COMPLETED",
                payload.clone(),
            )
            .await
            .unwrap();
        let Ingest::Fresh(row) = first else {
            panic!("first delivery must be fresh");
        };
        svc.mark_processed(row, WebhookEventStatus::Processed)
            .await
            .unwrap();

        let second = svc
            .record_event(
                PaymentGateway::Paypal,
                "WH-8",
                "PAYMENT.CAPTURE.COMPLETED",
                payload,
            )
            .await
            .unwrap();
        assert!(matches!(second, Ingest::Duplicate));

        let rows = webhook_event_entity::Entity::find()
            .filter(webhook_event_entity::Column::EventId.eq("WH-8"))
            .all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, WebhookEventStatus::Processed);
    }

    #[tokio::test]
    async fn test_failed_event_is_scheduled_for_retry() {
        let (svc, pool) = test_service().await;

        let row = webhook_event_entity::ActiveModel {
            gateway: Set(PaymentGateway::Paypal),
            event_id: Set("WH-6".to_string()),
            event_type: Set("PAYMENT.CAPTURE.COMPLETED".to_string()),
            status: Set(WebhookEventStatus::Received),
            payload: Set(serde_json::json!({})),
            attempt_count: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        svc.mark_failed(row, &AppError::GatewayError("boom".to_string()))
            .await
            .unwrap();

        let row = webhook_event_entity::Entity::find()
            .filter(webhook_event_entity::Column::EventId.eq("WH-6"))
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WebhookEventStatus::Failed);
        assert_eq!(row.attempt_count, 1);
        assert!(row.next_retry_at.unwrap() > Utc::now());
        assert!(row.last_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let (svc, pool) = test_service().await;

        let row = webhook_event_entity::ActiveModel {
            gateway: Set(PaymentGateway::Paypal),
            event_id: Set("WH-7".to_string()),
            event_type: Set("PAYMENT.CAPTURE.COMPLETED".to_string()),
            status: Set(WebhookEventStatus::Failed),
            payload: Set(serde_json::json!({})),
            attempt_count: Set(MAX_DELIVERY_ATTEMPTS - 1),
            next_retry_at: Set(Some(Utc::now() - Duration::minutes(1))),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        svc.mark_failed(row, &AppError::GatewayError("still broken".to_string()))
            .await
            .unwrap();

        let row = webhook_event_entity::Entity::find()
            .filter(webhook_event_entity::Column::EventId.eq("WH-7"))
            .one(&pool)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.attempt_count, MAX_DELIVERY_ATTEMPTS);
        assert!(row.next_retry_at.is_none());

        // Exhausted events are no longer picked up by the sweep
        assert_eq!(svc.process_due_retries().await.unwrap(), 0);
    }
}
