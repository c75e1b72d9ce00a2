use crate::config::StripeConfig;
use crate::error::{AppError, AppResult};
use std::collections::HashMap;
use std::str::FromStr;
use stripe::{
    CancelSubscription, Client, CreateCustomer, CreatePaymentIntent,
    CreatePaymentIntentAutomaticPaymentMethods,
    CreatePaymentIntentAutomaticPaymentMethodsAllowRedirects, CreateRefund, CreateSubscription,
    CreateSubscriptionItems, Currency, Customer, CustomerId, ErrorCode, Event, PaymentIntent,
    PaymentIntentId, Refund, RefundReason, RefundReasonFilter, StripeError, Subscription,
    SubscriptionId, SubscriptionPaymentBehavior, UpdatePaymentIntent, UpdateSubscription,
    UpdateSubscriptionItems, Webhook,
};

/// Thin wrapper around the Stripe API client. Services receive this by
/// value (it is cheap to clone) so they can be constructed with a stubbed
/// config in tests.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.secret_key.is_empty()
    }

    fn ensure_configured(&self) -> AppResult<()> {
        if !self.is_configured() {
            return Err(AppError::ConfigError(
                "Stripe secret key is not configured".to_string(),
            ));
        }
        Ok(())
    }

    pub fn parse_currency(currency: &str) -> AppResult<Currency> {
        Currency::from_str(&currency.to_ascii_lowercase())
            .map_err(|_| AppError::ValidationError(format!("Unsupported currency: {currency}")))
    }

    pub async fn create_customer(&self, email: &str, name: &str) -> AppResult<Customer> {
        self.ensure_configured()?;
        let customer = Customer::create(
            &self.client,
            CreateCustomer {
                email: Some(email),
                name: Some(name),
                ..Default::default()
            },
        )
        .await?;
        Ok(customer)
    }

    pub async fn create_payment_intent(
        &self,
        amount_in_smallest_unit: i64,
        currency: &str,
        customer_id: Option<&str>,
        description: &str,
        metadata: HashMap<String, String>,
    ) -> AppResult<PaymentIntent> {
        self.ensure_configured()?;

        let mut params =
            CreatePaymentIntent::new(amount_in_smallest_unit, Self::parse_currency(currency)?);
        params.description = Some(description);
        params.metadata = Some(metadata);
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            allow_redirects: Some(
                CreatePaymentIntentAutomaticPaymentMethodsAllowRedirects::Never,
            ),
        });
        if let Some(cid) = customer_id {
            params.customer = Some(
                CustomerId::from_str(cid)
                    .map_err(|_| AppError::ValidationError("Invalid customer id".to_string()))?,
            );
        }

        let pi = PaymentIntent::create(&self.client, params).await?;
        Ok(pi)
    }

    pub async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> AppResult<PaymentIntent> {
        self.ensure_configured()?;
        let id = PaymentIntentId::from_str(payment_intent_id)
            .map_err(|_| AppError::ValidationError("Invalid payment intent id".to_string()))?;
        let pi = PaymentIntent::retrieve(&self.client, &id, &[]).await?;
        Ok(pi)
    }

    /// Merge additional keys into an intent's metadata. Used to write the
    /// ledger row id back onto the intent after the row is inserted.
    pub async fn update_payment_intent_metadata(
        &self,
        payment_intent_id: &str,
        metadata: HashMap<String, String>,
    ) -> AppResult<PaymentIntent> {
        self.ensure_configured()?;
        let id = PaymentIntentId::from_str(payment_intent_id)
            .map_err(|_| AppError::ValidationError("Invalid payment intent id".to_string()))?;
        let pi = PaymentIntent::update(
            &self.client,
            &id,
            UpdatePaymentIntent {
                metadata: Some(metadata),
                ..Default::default()
            },
        )
        .await?;
        Ok(pi)
    }

    /// Create a subscription in `default_incomplete` mode so the initial
    /// invoice exposes a PaymentIntent client secret for the frontend to
    /// confirm.
    pub async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        trial_period_days: Option<u32>,
        metadata: HashMap<String, String>,
    ) -> AppResult<Subscription> {
        self.ensure_configured()?;

        let customer = CustomerId::from_str(customer_id)
            .map_err(|_| AppError::ValidationError("Invalid customer id".to_string()))?;

        let mut params = CreateSubscription::new(customer);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);
        params.expand = &["latest_invoice.payment_intent"];
        params.metadata = Some(metadata);
        if let Some(days) = trial_period_days
            && days > 0
        {
            params.trial_period_days = Some(days);
        }

        let sub = Subscription::create(&self.client, params).await?;
        Ok(sub)
    }

    pub async fn retrieve_subscription(&self, subscription_id: &str) -> AppResult<Subscription> {
        self.ensure_configured()?;
        let id = SubscriptionId::from_str(subscription_id)
            .map_err(|_| AppError::ValidationError("Invalid subscription id".to_string()))?;
        let sub = Subscription::retrieve(&self.client, &id, &[]).await?;
        Ok(sub)
    }

    pub async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> AppResult<Subscription> {
        self.ensure_configured()?;
        let id = SubscriptionId::from_str(subscription_id)
            .map_err(|_| AppError::ValidationError("Invalid subscription id".to_string()))?;
        let params = UpdateSubscription {
            cancel_at_period_end: Some(cancel),
            ..Default::default()
        };
        let sub = Subscription::update(&self.client, &id, params).await?;
        Ok(sub)
    }

    pub async fn cancel_subscription_now(&self, subscription_id: &str) -> AppResult<Subscription> {
        self.ensure_configured()?;
        let id = SubscriptionId::from_str(subscription_id)
            .map_err(|_| AppError::ValidationError("Invalid subscription id".to_string()))?;
        let sub = Subscription::cancel(
            &self.client,
            &id,
            CancelSubscription {
                ..Default::default()
            },
        )
        .await?;
        Ok(sub)
    }

    /// Swap the subscription onto a new price, prorating the difference.
    pub async fn change_subscription_price(
        &self,
        subscription_id: &str,
        new_price_id: &str,
    ) -> AppResult<Subscription> {
        self.ensure_configured()?;

        // The item id is required to replace the price in place
        let current = self.retrieve_subscription(subscription_id).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                AppError::GatewayError("Subscription has no items to update".to_string())
            })?;

        let id = SubscriptionId::from_str(subscription_id)
            .map_err(|_| AppError::ValidationError("Invalid subscription id".to_string()))?;
        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(new_price_id.to_string()),
                ..Default::default()
            }]),
            proration_behavior: Some(
                stripe::generated::billing::subscription::SubscriptionProrationBehavior::CreateProrations,
            ),
            ..Default::default()
        };
        let sub = Subscription::update(&self.client, &id, params).await?;
        Ok(sub)
    }

    pub async fn create_refund(
        &self,
        payment_intent_id: &str,
        amount_in_smallest_unit: Option<i64>,
        reason: Option<&str>,
    ) -> AppResult<Refund> {
        self.ensure_configured()?;

        let pi_id = PaymentIntentId::from_str(payment_intent_id)
            .map_err(|_| AppError::ValidationError("Invalid payment intent id".to_string()))?;

        let refund = Refund::create(
            &self.client,
            CreateRefund {
                payment_intent: Some(pi_id),
                amount: amount_in_smallest_unit,
                reason: reason.and_then(map_refund_reason).and_then(|r| match r {
                    RefundReason::Duplicate => Some(RefundReasonFilter::Duplicate),
                    RefundReason::Fraudulent => Some(RefundReasonFilter::Fraudulent),
                    RefundReason::RequestedByCustomer => Some(RefundReasonFilter::RequestedByCustomer),
                    RefundReason::ExpiredUncapturedCharge => None,
                }),
                ..Default::default()
            },
        )
        .await?;
        Ok(refund)
    }

    /// Verify the `Stripe-Signature` header and deserialize the event.
    pub fn construct_event(&self, payload: &str, signature: &str) -> AppResult<Event> {
        Webhook::construct_event(payload, signature, &self.config.webhook_secret)
            .map_err(|e| AppError::AuthError(format!("Invalid webhook signature: {e}")))
    }
}

fn map_refund_reason(reason: &str) -> Option<RefundReason> {
    match reason {
        "duplicate" => Some(RefundReason::Duplicate),
        "fraudulent" => Some(RefundReason::Fraudulent),
        "requested_by_customer" => Some(RefundReason::RequestedByCustomer),
        _ => None,
    }
}

/// Stripe rejects a refund for a charge that is already fully refunded.
/// The reconciler treats that as confirmation, not failure.
pub fn is_already_refunded(err: &AppError) -> bool {
    matches!(
        err,
        AppError::StripeError(StripeError::Stripe(req))
            if req.code == Some(ErrorCode::ChargeAlreadyRefunded)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_gateway_is_rejected() {
        let gw = StripeGateway::new(StripeConfig {
            secret_key: String::new(),
            webhook_secret: String::new(),
        });
        assert!(!gw.is_configured());
        assert!(gw.ensure_configured().is_err());
    }

    #[test]
    fn test_parse_currency() {
        assert!(StripeGateway::parse_currency("usd").is_ok());
        assert!(StripeGateway::parse_currency("USD").is_ok());
        assert!(StripeGateway::parse_currency("not-a-currency").is_err());
    }

    #[test]
    fn test_map_refund_reason() {
        assert_eq!(
            map_refund_reason("requested_by_customer"),
            Some(RefundReason::RequestedByCustomer)
        );
        assert_eq!(map_refund_reason("buyer changed mind"), None);
    }
}
