use crate::entities::{
    SubscriptionGateway, SubscriptionStatus, subscription_plan_entity, user_entity,
    user_subscription_entity,
};
use crate::error::{AppError, AppResult};
use crate::external::{PayPalGateway, PayPalSubscription, StripeGateway};
use crate::models::{
    CancelSubscriptionRequest, ChangePlanRequest, CreatePlanRequest, CreateSubscriptionRequest,
    CreateSubscriptionResponse, PlanChange, PlanResponse, SubscriptionResponse, UpdatePlanRequest,
};
use crate::services::status_map::{map_paypal_subscription_status, map_stripe_subscription_status};
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    QueryOrder, Set,
};
use std::collections::HashMap;

const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// How long an unapproved / unconfirmed subscription may linger before the
/// sweep marks it expired.
const PENDING_SUBSCRIPTION_TTL_HOURS: i64 = 24;

/// The fields of a gateway-side subscription that the local row mirrors.
/// Building this from a `stripe::Subscription` keeps webhook handling and
/// API-response handling on one code path.
#[derive(Debug, Clone)]
pub struct StripeSubscriptionSnapshot {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub raw_status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    /// Parsed from the subscription metadata, used to create the local row
    /// when the webhook for a subscription arrives before our own insert.
    pub user_id: Option<i64>,
    pub plan_id: Option<i64>,
}

impl StripeSubscriptionSnapshot {
    pub fn from_subscription(sub: &stripe::Subscription) -> Self {
        let price_id = sub
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Self {
            subscription_id: sub.id.to_string(),
            status: map_stripe_subscription_status(sub.status),
            raw_status: format!("{:?}", sub.status),
            current_period_start: DateTime::from_timestamp(sub.current_period_start, 0),
            current_period_end: DateTime::from_timestamp(sub.current_period_end, 0),
            trial_start: sub.trial_start.and_then(|t| DateTime::from_timestamp(t, 0)),
            trial_end: sub.trial_end.and_then(|t| DateTime::from_timestamp(t, 0)),
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: sub.canceled_at.and_then(|t| DateTime::from_timestamp(t, 0)),
            ended_at: sub.ended_at.and_then(|t| DateTime::from_timestamp(t, 0)),
            customer_id: Some(match &sub.customer {
                stripe::Expandable::Id(id) => id.to_string(),
                stripe::Expandable::Object(c) => c.id.to_string(),
            }),
            price_id,
            user_id: sub.metadata.get("user_id").and_then(|v| v.parse().ok()),
            plan_id: sub.metadata.get("plan_id").and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: DatabaseConnection,
    stripe: StripeGateway,
    paypal: PayPalGateway,
    frontend_base_url: String,
}

impl SubscriptionService {
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

    // ---------- plan management ----------

    pub async fn create_plan(&self, req: CreatePlanRequest) -> AppResult<PlanResponse> {
        if req.name.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Plan name cannot be empty".to_string(),
            ));
        }
        if req.price < 0.0 {
            return Err(AppError::ValidationError(
                "Plan price cannot be negative".to_string(),
            ));
        }
        if req.stripe_price_id.is_none() && req.paypal_plan_id.is_none() {
            return Err(AppError::ValidationError(
                "A plan needs a Stripe price id or a PayPal plan id".to_string(),
            ));
        }

        let existing = subscription_plan_entity::Entity::find()
            .filter(subscription_plan_entity::Column::Name.eq(req.name.trim()))
            .one(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(AppError::Conflict(format!(
                "Plan '{}' already exists",
                req.name.trim()
            )));
        }

        let plan = subscription_plan_entity::ActiveModel {
            name: Set(req.name.trim().to_string()),
            description: Set(req.description),
            stripe_price_id: Set(req.stripe_price_id),
            paypal_plan_id: Set(req.paypal_plan_id),
            price: Set(req.price),
            currency: Set(req.currency.to_ascii_lowercase()),
            interval: Set(req.interval),
            interval_count: Set(req.interval_count.max(1)),
            trial_period_days: Set(req.trial_period_days.max(0)),
            is_active: Set(true),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!("Created subscription plan {} ({})", plan.id, plan.name);
        Ok(PlanResponse::from(plan))
    }

    pub async fn update_plan(&self, plan_id: i64, req: UpdatePlanRequest) -> AppResult<PlanResponse> {
        let plan = self.get_plan_model(plan_id).await?;

        // A plan with live subscribers keeps its billing terms; changing
        // them means creating a new plan. Name, description, and the
        // is_active flag stay editable.
        let wants_billing_change =
            req.stripe_price_id.is_some() || req.paypal_plan_id.is_some() || req.price.is_some();
        if wants_billing_change && self.plan_has_live_subscribers(plan_id).await? {
            return Err(AppError::Conflict(
                "Plan is referenced by live subscriptions; create a new plan instead".to_string(),
            ));
        }

        let mut am = plan.into_active_model();

        if let Some(name) = req.name {
            if name.trim().is_empty() {
                return Err(AppError::ValidationError(
                    "Plan name cannot be empty".to_string(),
                ));
            }
            am.name = Set(name.trim().to_string());
        }
        if let Some(description) = req.description {
            am.description = Set(Some(description));
        }
        if let Some(price_id) = req.stripe_price_id {
            am.stripe_price_id = Set(Some(price_id));
        }
        if let Some(paypal_plan_id) = req.paypal_plan_id {
            am.paypal_plan_id = Set(Some(paypal_plan_id));
        }
        if let Some(price) = req.price {
            if price < 0.0 {
                return Err(AppError::ValidationError(
                    "Plan price cannot be negative".to_string(),
                ));
            }
            am.price = Set(price);
        }
        if let Some(days) = req.trial_period_days {
            am.trial_period_days = Set(days.max(0));
        }
        if let Some(active) = req.is_active {
            am.is_active = Set(active);
        }
        am.updated_at = Set(Some(Utc::now()));

        let plan = am.update(&self.pool).await?;
        Ok(PlanResponse::from(plan))
    }

    pub async fn list_active_plans(&self) -> AppResult<Vec<PlanResponse>> {
        let plans = subscription_plan_entity::Entity::find()
            .filter(subscription_plan_entity::Column::IsActive.eq(true))
            .order_by_asc(subscription_plan_entity::Column::Price)
            .all(&self.pool)
            .await?;
        Ok(plans.into_iter().map(PlanResponse::from).collect())
    }

    pub async fn get_plan(&self, plan_id: i64) -> AppResult<PlanResponse> {
        Ok(PlanResponse::from(self.get_plan_model(plan_id).await?))
    }

    async fn plan_has_live_subscribers(&self, plan_id: i64) -> AppResult<bool> {
        let live = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::PlanId.eq(plan_id))
            .filter(
                user_subscription_entity::Column::Status.is_not_in([
                    SubscriptionStatus::Canceled,
                    SubscriptionStatus::Expired,
                ]),
            )
            .one(&self.pool)
            .await?;
        Ok(live.is_some())
    }

    async fn get_plan_model(&self, plan_id: i64) -> AppResult<subscription_plan_entity::Model> {
        subscription_plan_entity::Entity::find_by_id(plan_id)
            .one(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound("Plan not found".to_string()))
    }

    // ---------- subscription lifecycle ----------

    pub async fn create_subscription(
        &self,
        user_id: i64,
        req: CreateSubscriptionRequest,
    ) -> AppResult<CreateSubscriptionResponse> {
        let plan = self.get_plan_model(req.plan_id).await?;
        if !plan.is_active {
            return Err(AppError::ValidationError(
                "Plan is not available".to_string(),
            ));
        }

        if let Some(existing) = self.find_current_subscription(user_id).await? {
            if !existing.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "User already has a subscription in status '{}'",
                    existing.status
                )));
            }
        }

        match req.gateway {
            SubscriptionGateway::Stripe => self.create_stripe_subscription(user_id, plan).await,
            SubscriptionGateway::Paypal => self.create_paypal_subscription(user_id, plan).await,
        }
    }

    async fn create_stripe_subscription(
        &self,
        user_id: i64,
        plan: subscription_plan_entity::Model,
    ) -> AppResult<CreateSubscriptionResponse> {
        let price_id = plan.stripe_price_id.clone().ok_or_else(|| {
            AppError::ValidationError("Plan has no Stripe price configured".to_string())
        })?;

        let customer_id = self.ensure_stripe_customer(user_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan_id".to_string(), plan.id.to_string());

        let trial_days = if plan.trial_period_days > 0 {
            Some(plan.trial_period_days as u32)
        } else {
            None
        };

        let sub = self
            .stripe
            .create_subscription(&customer_id, &price_id, trial_days, metadata)
            .await?;

        let client_secret = sub
            .latest_invoice
            .as_ref()
            .and_then(|inv| inv.as_object())
            .and_then(|inv| inv.payment_intent.as_ref())
            .and_then(|pi| pi.as_object())
            .and_then(|pi| pi.client_secret.clone());

        let snapshot = StripeSubscriptionSnapshot::from_subscription(&sub);
        let row = user_subscription_entity::ActiveModel {
            user_id: Set(user_id),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Stripe),
            stripe_subscription_id: Set(Some(snapshot.subscription_id.clone())),
            gateway_customer_id: Set(Some(customer_id)),
            gateway_price_or_plan_id: Set(price_id),
            status: Set(snapshot.status),
            current_period_start: Set(snapshot.current_period_start),
            current_period_end: Set(snapshot.current_period_end),
            trial_start: Set(snapshot.trial_start),
            trial_end: Set(snapshot.trial_end),
            cancel_at_period_end: Set(false),
            last_gateway_status: Set(Some(snapshot.raw_status.clone())),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!(
            "Created Stripe subscription {} for user {user_id}, plan {}",
            snapshot.subscription_id,
            plan.id
        );

        Ok(CreateSubscriptionResponse {
            subscription: SubscriptionResponse::from(row),
            client_secret,
            approval_link: None,
        })
    }

    async fn create_paypal_subscription(
        &self,
        user_id: i64,
        plan: subscription_plan_entity::Model,
    ) -> AppResult<CreateSubscriptionResponse> {
        let paypal_plan_id = plan.paypal_plan_id.clone().ok_or_else(|| {
            AppError::ValidationError("Plan has no PayPal plan configured".to_string())
        })?;

        let sub = self
            .paypal
            .create_subscription(
                &paypal_plan_id,
                &format!("user:{user_id}:plan:{}", plan.id),
                &format!("{}/subscription/paypal/return", self.frontend_base_url),
                &format!("{}/subscription/paypal/cancel", self.frontend_base_url),
            )
            .await?;

        let approval_link = sub.approval_link();
        let status = map_paypal_subscription_status(&sub.status, sub.billing_info.as_ref())
            .unwrap_or(SubscriptionStatus::PendingApproval);

        let row = user_subscription_entity::ActiveModel {
            user_id: Set(user_id),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Paypal),
            paypal_subscription_id: Set(Some(sub.id.clone())),
            gateway_price_or_plan_id: Set(paypal_plan_id),
            status: Set(status),
            cancel_at_period_end: Set(false),
            last_gateway_status: Set(Some(sub.status.clone())),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!(
            "Created PayPal subscription {} for user {user_id}, plan {}",
            sub.id,
            plan.id
        );

        Ok(CreateSubscriptionResponse {
            subscription: SubscriptionResponse::from(row),
            client_secret: None,
            approval_link,
        })
    }

    pub async fn cancel_subscription(
        &self,
        user_id: i64,
        req: CancelSubscriptionRequest,
    ) -> AppResult<SubscriptionResponse> {
        let sub = self
            .find_current_subscription(user_id)
            .await?
            .filter(|s| !s.status.is_terminal())
            .ok_or_else(|| AppError::NotFound("No active subscription".to_string()))?;

        match (sub.gateway.clone(), req.at_period_end) {
            (SubscriptionGateway::Stripe, true) => {
                let sid = sub.stripe_subscription_id.clone().ok_or_else(|| {
                    AppError::InternalError("Subscription has no gateway id".to_string())
                })?;
                self.stripe.set_cancel_at_period_end(&sid, true).await?;

                let mut am = sub.into_active_model();
                am.cancel_at_period_end = Set(true);
                am.updated_at = Set(Some(Utc::now()));
                let row = am.update(&self.pool).await?;
                log::info!("Subscription {} will cancel at period end", row.id);
                Ok(SubscriptionResponse::from(row))
            }
            (SubscriptionGateway::Stripe, false) => {
                let sid = sub.stripe_subscription_id.clone().ok_or_else(|| {
                    AppError::InternalError("Subscription has no gateway id".to_string())
                })?;
                self.stripe.cancel_subscription_now(&sid).await?;

                let mut am = sub.into_active_model();
                am.status = Set(SubscriptionStatus::Canceled);
                am.canceled_at = Set(Some(Utc::now()));
                am.ended_at = Set(Some(Utc::now()));
                am.updated_at = Set(Some(Utc::now()));
                let row = am.update(&self.pool).await?;
                log::info!("Subscription {} canceled immediately", row.id);
                Ok(SubscriptionResponse::from(row))
            }
            (SubscriptionGateway::Paypal, at_period_end) => {
                let sid = sub.paypal_subscription_id.clone().ok_or_else(|| {
                    AppError::InternalError("Subscription has no gateway id".to_string())
                })?;
                let reason = req.reason.as_deref().unwrap_or("Canceled by user");

                if at_period_end {
                    // PayPal has no scheduled cancellation. The gateway is
                    // canceled now so there is no further billing, while
                    // access runs until the paid period ends; the periodic
                    // sweep flips the row once the period is over.
                    self.paypal.cancel_subscription(&sid, reason).await?;
                    let mut am = sub.into_active_model();
                    am.cancel_at_period_end = Set(true);
                    am.canceled_at = Set(Some(Utc::now()));
                    am.updated_at = Set(Some(Utc::now()));
                    let row = am.update(&self.pool).await?;
                    log::info!(
                        "PayPal subscription {} canceled at gateway, access until period end",
                        row.id
                    );
                    Ok(SubscriptionResponse::from(row))
                } else {
                    self.paypal.cancel_subscription(&sid, reason).await?;
                    let mut am = sub.into_active_model();
                    am.status = Set(SubscriptionStatus::Canceled);
                    am.canceled_at = Set(Some(Utc::now()));
                    am.ended_at = Set(Some(Utc::now()));
                    am.updated_at = Set(Some(Utc::now()));
                    let row = am.update(&self.pool).await?;
                    log::info!("PayPal subscription {} canceled immediately", row.id);
                    Ok(SubscriptionResponse::from(row))
                }
            }
        }
    }

    /// Switch a Stripe subscription to a different plan's price, with
    /// proration. PayPal subscriptions cannot change plans in place.
    pub async fn change_plan(
        &self,
        user_id: i64,
        req: ChangePlanRequest,
    ) -> AppResult<SubscriptionResponse> {
        let sub = self
            .find_current_subscription(user_id)
            .await?
            .filter(|s| !s.status.is_terminal())
            .ok_or_else(|| AppError::NotFound("No active subscription".to_string()))?;

        if sub.gateway != SubscriptionGateway::Stripe {
            return Err(AppError::ValidationError(
                "Plan changes are only supported for Stripe subscriptions; cancel and resubscribe instead".to_string(),
            ));
        }
        if sub.plan_id == req.new_plan_id {
            return Err(AppError::ValidationError(
                "Subscription is already on this plan".to_string(),
            ));
        }

        let new_plan = self.get_plan_model(req.new_plan_id).await?;
        if !new_plan.is_active {
            return Err(AppError::ValidationError(
                "Plan is not available".to_string(),
            ));
        }
        let new_price_id = new_plan.stripe_price_id.clone().ok_or_else(|| {
            AppError::ValidationError("Plan has no Stripe price configured".to_string())
        })?;
        let sid = sub.stripe_subscription_id.clone().ok_or_else(|| {
            AppError::InternalError("Subscription has no gateway id".to_string())
        })?;

        self.stripe
            .change_subscription_price(&sid, &new_price_id)
            .await?;

        let mut history: Vec<PlanChange> = sub
            .plan_change_history
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        history.push(PlanChange {
            from_plan_id: sub.plan_id,
            to_plan_id: new_plan.id,
            changed_at: Utc::now(),
        });

        let old_plan_id = sub.plan_id;
        let mut am = sub.into_active_model();
        am.plan_id = Set(new_plan.id);
        am.gateway_price_or_plan_id = Set(new_price_id);
        am.plan_change_history = Set(Some(serde_json::to_value(&history)?));
        am.updated_at = Set(Some(Utc::now()));
        let row = am.update(&self.pool).await?;

        log::info!(
            "Subscription {} changed plan {old_plan_id} -> {}",
            row.id,
            new_plan.id
        );
        Ok(SubscriptionResponse::from(row))
    }

    pub async fn get_my_subscription(
        &self,
        user_id: i64,
    ) -> AppResult<Option<SubscriptionResponse>> {
        Ok(self
            .find_current_subscription(user_id)
            .await?
            .map(SubscriptionResponse::from))
    }

    /// The user's most relevant subscription row: a non-terminal one if any,
    /// otherwise the most recent.
    pub async fn find_current_subscription(
        &self,
        user_id: i64,
    ) -> AppResult<Option<user_subscription_entity::Model>> {
        let rows = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::UserId.eq(user_id))
            .order_by_desc(user_subscription_entity::Column::CreatedAt)
            .all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .find(|s| !s.status.is_terminal())
            .cloned()
            .or_else(|| rows.into_iter().next()))
    }

    // ---------- webhook-facing reconciliation ----------

    /// Mirror a Stripe-side subscription state into the local row. Creates
    /// the row from metadata when the webhook outruns our own insert.
    /// Returns whether anything changed.
    pub async fn apply_stripe_snapshot(
        &self,
        snapshot: &StripeSubscriptionSnapshot,
    ) -> AppResult<bool> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let existing = user_subscription_entity::Entity::find()
                .filter(
                    user_subscription_entity::Column::StripeSubscriptionId
                        .eq(snapshot.subscription_id.as_str()),
                )
                .one(&self.pool)
                .await?;

            let Some(sub) = existing else {
                let (Some(user_id), Some(plan_id)) = (snapshot.user_id, snapshot.plan_id) else {
                    log::warn!(
                        "No local row for Stripe subscription {} and no metadata to create one",
                        snapshot.subscription_id
                    );
                    return Ok(false);
                };
                user_subscription_entity::ActiveModel {
                    user_id: Set(user_id),
                    plan_id: Set(plan_id),
                    gateway: Set(SubscriptionGateway::Stripe),
                    stripe_subscription_id: Set(Some(snapshot.subscription_id.clone())),
                    gateway_customer_id: Set(snapshot.customer_id.clone()),
                    gateway_price_or_plan_id: Set(snapshot.price_id.clone().unwrap_or_default()),
                    status: Set(snapshot.status),
                    current_period_start: Set(snapshot.current_period_start),
                    current_period_end: Set(snapshot.current_period_end),
                    trial_start: Set(snapshot.trial_start),
                    trial_end: Set(snapshot.trial_end),
                    cancel_at_period_end: Set(snapshot.cancel_at_period_end),
                    canceled_at: Set(snapshot.canceled_at),
                    ended_at: Set(snapshot.ended_at),
                    last_gateway_status: Set(Some(snapshot.raw_status.clone())),
                    last_webhook_sync_at: Set(Some(Utc::now())),
                    version: Set(0),
                    created_at: Set(Some(Utc::now())),
                    updated_at: Set(Some(Utc::now())),
                    ..Default::default()
                }
                .insert(&self.pool)
                .await?;
                log::info!(
                    "Created subscription row for Stripe subscription {} from webhook",
                    snapshot.subscription_id
                );
                return Ok(true);
            };

            // A terminal row never reopens from a late-arriving snapshot.
            if sub.status.is_terminal() && !snapshot.status.is_terminal() {
                log::info!(
                    "Ignoring stale status '{}' for terminal subscription {}",
                    snapshot.raw_status,
                    sub.id
                );
                self.touch_sync_metadata(sub.id, &snapshot.raw_status).await?;
                return Ok(false);
            }

            let result = user_subscription_entity::Entity::update_many()
                .filter(user_subscription_entity::Column::Id.eq(sub.id))
                .filter(user_subscription_entity::Column::Version.eq(sub.version))
                .col_expr(
                    user_subscription_entity::Column::Status,
                    Expr::value(snapshot.status),
                )
                .col_expr(
                    user_subscription_entity::Column::CurrentPeriodStart,
                    Expr::value(snapshot.current_period_start),
                )
                .col_expr(
                    user_subscription_entity::Column::CurrentPeriodEnd,
                    Expr::value(snapshot.current_period_end),
                )
                .col_expr(
                    user_subscription_entity::Column::TrialStart,
                    Expr::value(snapshot.trial_start),
                )
                .col_expr(
                    user_subscription_entity::Column::TrialEnd,
                    Expr::value(snapshot.trial_end),
                )
                .col_expr(
                    user_subscription_entity::Column::CancelAtPeriodEnd,
                    Expr::value(snapshot.cancel_at_period_end),
                )
                .col_expr(
                    user_subscription_entity::Column::CanceledAt,
                    Expr::value(snapshot.canceled_at),
                )
                .col_expr(
                    user_subscription_entity::Column::EndedAt,
                    Expr::value(snapshot.ended_at),
                )
                .col_expr(
                    user_subscription_entity::Column::LastGatewayStatus,
                    Expr::value(Some(snapshot.raw_status.clone())),
                )
                .col_expr(
                    user_subscription_entity::Column::LastWebhookSyncAt,
                    Expr::value(Some(Utc::now())),
                )
                .col_expr(
                    user_subscription_entity::Column::Version,
                    Expr::value(sub.version + 1),
                )
                .col_expr(
                    user_subscription_entity::Column::UpdatedAt,
                    Expr::value(Some(Utc::now())),
                )
                .exec(&self.pool)
                .await?;

            if result.rows_affected > 0 {
                if sub.status != snapshot.status {
                    log::info!(
                        "Subscription {} transitioned {} -> {}",
                        sub.id,
                        sub.status,
                        snapshot.status
                    );
                }
                return Ok(true);
            }
        }

        Err(AppError::Conflict(format!(
            "Subscription update for {} kept conflicting",
            snapshot.subscription_id
        )))
    }

    /// Mirror a PayPal-side subscription into the local row. An
    /// unrecognized gateway status only refreshes the audit columns.
    pub async fn apply_paypal_subscription(&self, sub: &PayPalSubscription) -> AppResult<bool> {
        let mapped = map_paypal_subscription_status(&sub.status, sub.billing_info.as_ref());

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let existing = user_subscription_entity::Entity::find()
                .filter(
                    user_subscription_entity::Column::PaypalSubscriptionId.eq(sub.id.as_str()),
                )
                .one(&self.pool)
                .await?;

            let Some(row) = existing else {
                let Some((user_id, plan_id)) =
                    sub.custom_id.as_deref().and_then(parse_user_plan_custom_id)
                else {
                    log::warn!(
                        "No local row for PayPal subscription {} and no parseable custom_id",
                        sub.id
                    );
                    return Ok(false);
                };
                user_subscription_entity::ActiveModel {
                    user_id: Set(user_id),
                    plan_id: Set(plan_id),
                    gateway: Set(SubscriptionGateway::Paypal),
                    paypal_subscription_id: Set(Some(sub.id.clone())),
                    gateway_price_or_plan_id: Set(sub.plan_id.clone().unwrap_or_default()),
                    status: Set(mapped.unwrap_or(SubscriptionStatus::PendingApproval)),
                    current_period_end: Set(sub
                        .billing_info
                        .as_ref()
                        .and_then(|b| b.next_billing_time)),
                    cancel_at_period_end: Set(false),
                    last_gateway_status: Set(Some(sub.status.clone())),
                    last_webhook_sync_at: Set(Some(Utc::now())),
                    version: Set(0),
                    created_at: Set(Some(Utc::now())),
                    updated_at: Set(Some(Utc::now())),
                    ..Default::default()
                }
                .insert(&self.pool)
                .await?;
                log::info!(
                    "Created subscription row for PayPal subscription {} from webhook",
                    sub.id
                );
                return Ok(true);
            };

            let Some(new_status) = mapped else {
                log::warn!(
                    "Unrecognized PayPal subscription status '{}' for {}, recording raw only",
                    sub.status,
                    sub.id
                );
                self.touch_sync_metadata(row.id, &sub.status).await?;
                return Ok(false);
            };

            if row.status.is_terminal() && !new_status.is_terminal() {
                log::info!(
                    "Ignoring stale status '{}' for terminal subscription {}",
                    sub.status,
                    row.id
                );
                self.touch_sync_metadata(row.id, &sub.status).await?;
                return Ok(false);
            }

            let period_start = sub
                .billing_info
                .as_ref()
                .and_then(|b| b.last_payment.as_ref())
                .and_then(|p| p.time);
            let period_end = sub.billing_info.as_ref().and_then(|b| b.next_billing_time);

            let mut update = user_subscription_entity::Entity::update_many()
                .filter(user_subscription_entity::Column::Id.eq(row.id))
                .filter(user_subscription_entity::Column::Version.eq(row.version))
                .col_expr(
                    user_subscription_entity::Column::Status,
                    Expr::value(new_status),
                )
                .col_expr(
                    user_subscription_entity::Column::LastGatewayStatus,
                    Expr::value(Some(sub.status.clone())),
                )
                .col_expr(
                    user_subscription_entity::Column::LastWebhookSyncAt,
                    Expr::value(Some(Utc::now())),
                )
                .col_expr(
                    user_subscription_entity::Column::Version,
                    Expr::value(row.version + 1),
                )
                .col_expr(
                    user_subscription_entity::Column::UpdatedAt,
                    Expr::value(Some(Utc::now())),
                );
            if period_start.is_some() {
                update = update.col_expr(
                    user_subscription_entity::Column::CurrentPeriodStart,
                    Expr::value(period_start),
                );
            }
            if period_end.is_some() {
                update = update.col_expr(
                    user_subscription_entity::Column::CurrentPeriodEnd,
                    Expr::value(period_end),
                );
            }
            if new_status.is_terminal() {
                update = update.col_expr(
                    user_subscription_entity::Column::EndedAt,
                    Expr::value(Some(Utc::now())),
                );
            }

            let result = update.exec(&self.pool).await?;
            if result.rows_affected > 0 {
                if row.status != new_status {
                    log::info!(
                        "Subscription {} transitioned {} -> {new_status}",
                        row.id,
                        row.status
                    );
                }
                return Ok(true);
            }
        }

        Err(AppError::Conflict(format!(
            "Subscription update for {} kept conflicting",
            sub.id
        )))
    }

    async fn touch_sync_metadata(&self, subscription_id: i64, raw_status: &str) -> AppResult<()> {
        user_subscription_entity::Entity::update_many()
            .filter(user_subscription_entity::Column::Id.eq(subscription_id))
            .col_expr(
                user_subscription_entity::Column::LastGatewayStatus,
                Expr::value(Some(raw_status.to_string())),
            )
            .col_expr(
                user_subscription_entity::Column::LastWebhookSyncAt,
                Expr::value(Some(Utc::now())),
            )
            .exec(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn find_by_stripe_subscription_id(
        &self,
        subscription_id: &str,
    ) -> AppResult<Option<user_subscription_entity::Model>> {
        let row = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::StripeSubscriptionId.eq(subscription_id))
            .one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn find_by_paypal_subscription_id(
        &self,
        subscription_id: &str,
    ) -> AppResult<Option<user_subscription_entity::Model>> {
        let row = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::PaypalSubscriptionId.eq(subscription_id))
            .one(&self.pool)
            .await?;
        Ok(row)
    }

    // ---------- periodic sweep ----------

    /// Close out subscriptions the gateways will not push events for:
    /// period-end cancellations past their period, and checkout attempts
    /// that were never approved or confirmed.
    pub async fn expire_overdue_subscriptions(&self) -> AppResult<u64> {
        let now = Utc::now();
        let mut swept = 0u64;

        let pending_cancel = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::CancelAtPeriodEnd.eq(true))
            .all(&self.pool)
            .await?;
        for sub in pending_cancel {
            if sub.status.is_terminal() {
                continue;
            }
            let period_over = sub
                .current_period_end
                .map(|end| end <= now)
                .unwrap_or(false);
            if !period_over {
                continue;
            }
            let id = sub.id;
            let mut am = sub.into_active_model();
            am.status = Set(SubscriptionStatus::Canceled);
            am.ended_at = Set(Some(now));
            am.updated_at = Set(Some(now));
            am.update(&self.pool).await?;
            log::info!("Subscription {id} reached its final period end, now canceled");
            swept += 1;
        }

        let cutoff = now - Duration::hours(PENDING_SUBSCRIPTION_TTL_HOURS);
        let stale_pending = user_subscription_entity::Entity::find()
            .filter(
                user_subscription_entity::Column::Status.is_in([
                    SubscriptionStatus::Incomplete,
                    SubscriptionStatus::PendingApproval,
                ]),
            )
            .all(&self.pool)
            .await?;
        for sub in stale_pending {
            let too_old = sub.created_at.map(|t| t <= cutoff).unwrap_or(false);
            if !too_old {
                continue;
            }
            let id = sub.id;
            let mut am = sub.into_active_model();
            am.status = Set(SubscriptionStatus::Expired);
            am.ended_at = Set(Some(now));
            am.updated_at = Set(Some(now));
            am.update(&self.pool).await?;
            log::info!("Subscription {id} was never activated, now expired");
            swept += 1;
        }

        Ok(swept)
    }

    // ---------- helpers ----------

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

/// Parse the "user:{id}:plan:{id}" custom_id we attach to PayPal
/// subscriptions.
fn parse_user_plan_custom_id(custom_id: &str) -> Option<(i64, i64)> {
    let mut parts = custom_id.split(':');
    if parts.next() != Some("user") {
        return None;
    }
    let user_id = parts.next()?.parse().ok()?;
    if parts.next() != Some("plan") {
        return None;
    }
    let plan_id = parts.next()?.parse().ok()?;
    Some((user_id, plan_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PayPalConfig, StripeConfig};
    use crate::entities::PlanInterval;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn test_service() -> (SubscriptionService, DatabaseConnection) {
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
        let svc = SubscriptionService::new(
            pool.clone(),
            stripe,
            paypal,
            "http://localhost:3000".to_string(),
        );
        (svc, pool)
    }

    async fn seed_plan(svc: &SubscriptionService) -> PlanResponse {
        svc.create_plan(CreatePlanRequest {
            name: "Pro".to_string(),
            description: None,
            stripe_price_id: Some("price_1".to_string()),
            paypal_plan_id: Some("P-1".to_string()),
            price: 9.99,
            currency: "usd".to_string(),
            interval: PlanInterval::Month,
            interval_count: 1,
            trial_period_days: 7,
        })
        .await
        .unwrap()
    }

    fn paypal_active_subscription(id: &str, custom_id: &str) -> PayPalSubscription {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "status": "ACTIVE",
            "plan_id": "P-1",
            "custom_id": custom_id,
            "billing_info": {
                "next_billing_time": "2026-10-01T00:00:00Z",
                "cycle_executions": [
                    {"tenure_type": "REGULAR", "cycles_completed": 1, "cycles_remaining": 0, "total_cycles": 0}
                ]
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_plan_name_conflicts() {
        let (svc, _pool) = test_service().await;
        seed_plan(&svc).await;
        let err = svc
            .create_plan(CreatePlanRequest {
                name: "Pro".to_string(),
                description: None,
                stripe_price_id: Some("price_2".to_string()),
                paypal_plan_id: None,
                price: 19.99,
                currency: "usd".to_string(),
                interval: PlanInterval::Month,
                interval_count: 1,
                trial_period_days: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_second_subscription_is_rejected() {
        let (svc, pool) = test_service().await;
        let plan = seed_plan(&svc).await;

        user_subscription_entity::ActiveModel {
            user_id: Set(1),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Stripe),
            stripe_subscription_id: Set(Some("sub_1".to_string())),
            gateway_price_or_plan_id: Set("price_1".to_string()),
            status: Set(SubscriptionStatus::Active),
            cancel_at_period_end: Set(false),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        let err = svc
            .create_subscription(
                1,
                CreateSubscriptionRequest {
                    plan_id: plan.id,
                    gateway: SubscriptionGateway::Stripe,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_referenced_plan_billing_terms_are_frozen() {
        let (svc, pool) = test_service().await;
        let plan = seed_plan(&svc).await;

        user_subscription_entity::ActiveModel {
            user_id: Set(1),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Stripe),
            stripe_subscription_id: Set(Some("sub_frozen".to_string())),
            gateway_price_or_plan_id: Set("price_1".to_string()),
            status: Set(SubscriptionStatus::Active),
            cancel_at_period_end: Set(false),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        let err = svc
            .update_plan(
                plan.id,
                UpdatePlanRequest {
                    price: Some(14.99),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Non-billing fields stay editable
        let renamed = svc
            .update_plan(
                plan.id,
                UpdatePlanRequest {
                    name: Some("Pro (legacy)".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Pro (legacy)");
        assert_eq!(renamed.price, 9.99);
    }

    #[tokio::test]
    async fn test_paypal_activation_creates_row_and_stays_idempotent() {
        let (svc, pool) = test_service().await;
        let plan = seed_plan(&svc).await;
        let custom_id = format!("user:1:plan:{}", plan.id);
        let sub = paypal_active_subscription("I-ABC", &custom_id);

        // Activation webhook arrives before any local row exists
        assert!(svc.apply_paypal_subscription(&sub).await.unwrap());
        // Redelivered event converges to the same state
        assert!(svc.apply_paypal_subscription(&sub).await.unwrap());

        let rows = user_subscription_entity::Entity::find()
            .filter(user_subscription_entity::Column::PaypalSubscriptionId.eq("I-ABC"))
            .all(&pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, SubscriptionStatus::Active);
        assert_eq!(rows[0].user_id, 1);
        assert!(rows[0].current_period_end.is_some());
    }

    #[tokio::test]
    async fn test_terminal_subscription_ignores_late_active_event() {
        let (svc, pool) = test_service().await;
        let plan = seed_plan(&svc).await;

        user_subscription_entity::ActiveModel {
            user_id: Set(1),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Paypal),
            paypal_subscription_id: Set(Some("I-DEF".to_string())),
            gateway_price_or_plan_id: Set("P-1".to_string()),
            status: Set(SubscriptionStatus::Canceled),
            cancel_at_period_end: Set(false),
            canceled_at: Set(Some(Utc::now())),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        let sub = paypal_active_subscription("I-DEF", "user:1:plan:1");
        assert!(!svc.apply_paypal_subscription(&sub).await.unwrap());

        let row = svc
            .find_by_paypal_subscription_id("I-DEF")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        // The late event is still visible in the audit columns
        assert_eq!(row.last_gateway_status.as_deref(), Some("ACTIVE"));
    }

    #[tokio::test]
    async fn test_access_flag_follows_subscription_status() {
        let (svc, pool) = test_service().await;
        let plan = seed_plan(&svc).await;

        for (user_id, sid, status) in [
            (1, "sub_access_1", SubscriptionStatus::Active),
            (2, "sub_access_2", SubscriptionStatus::Suspended),
            (3, "sub_access_3", SubscriptionStatus::Trialing),
        ] {
            user_subscription_entity::ActiveModel {
                user_id: Set(user_id),
                plan_id: Set(plan.id),
                gateway: Set(SubscriptionGateway::Stripe),
                stripe_subscription_id: Set(Some(sid.to_string())),
                gateway_price_or_plan_id: Set("price_1".to_string()),
                status: Set(status),
                cancel_at_period_end: Set(false),
                version: Set(0),
                created_at: Set(Some(Utc::now())),
                updated_at: Set(Some(Utc::now())),
                ..Default::default()
            }
            .insert(&pool)
            .await
            .unwrap();
        }

        let active = svc.get_my_subscription(1).await.unwrap().unwrap();
        assert!(active.grants_access);
        let suspended = svc.get_my_subscription(2).await.unwrap().unwrap();
        assert!(!suspended.grants_access);
        let trialing = svc.get_my_subscription(3).await.unwrap().unwrap();
        assert!(trialing.grants_access);
    }

    #[tokio::test]
    async fn test_sweep_closes_overdue_and_stale_rows() {
        let (svc, pool) = test_service().await;
        let plan = seed_plan(&svc).await;

        // Period-end cancellation whose period is over
        user_subscription_entity::ActiveModel {
            user_id: Set(1),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Stripe),
            stripe_subscription_id: Set(Some("sub_sweep_1".to_string())),
            gateway_price_or_plan_id: Set("price_1".to_string()),
            status: Set(SubscriptionStatus::Active),
            cancel_at_period_end: Set(true),
            current_period_end: Set(Some(Utc::now() - Duration::hours(1))),
            version: Set(0),
            created_at: Set(Some(Utc::now())),
            updated_at: Set(Some(Utc::now())),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        // Checkout attempt that was never approved
        user_subscription_entity::ActiveModel {
            user_id: Set(2),
            plan_id: Set(plan.id),
            gateway: Set(SubscriptionGateway::Paypal),
            paypal_subscription_id: Set(Some("I-SWEEP".to_string())),
            gateway_price_or_plan_id: Set("P-1".to_string()),
            status: Set(SubscriptionStatus::PendingApproval),
            cancel_at_period_end: Set(false),
            version: Set(0),
            created_at: Set(Some(Utc::now() - Duration::hours(48))),
            updated_at: Set(Some(Utc::now() - Duration::hours(48))),
            ..Default::default()
        }
        .insert(&pool)
        .await
        .unwrap();

        let swept = svc.expire_overdue_subscriptions().await.unwrap();
        assert_eq!(swept, 2);

        let canceled = svc
            .find_by_stripe_subscription_id("sub_sweep_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);

        let expired = svc
            .find_by_paypal_subscription_id("I-SWEEP")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn test_custom_id_parsing() {
        assert_eq!(parse_user_plan_custom_id("user:42:plan:7"), Some((42, 7)));
        assert_eq!(parse_user_plan_custom_id("user:42:course:7"), None);
        assert_eq!(parse_user_plan_custom_id("garbage"), None);
    }
}
