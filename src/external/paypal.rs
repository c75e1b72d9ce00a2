use crate::config::PayPalConfig;
use crate::error::{AppError, AppResult};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayPalAmount {
    pub currency_code: String,
    /// Decimal string in major units, e.g. "49.99".
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayPalLink {
    pub href: String,
    pub rel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalCapture {
    pub id: String,
    pub status: String,
    pub amount: Option<PayPalAmount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalPayments {
    #[serde(default)]
    pub captures: Vec<PayPalCapture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalPurchaseUnit {
    pub custom_id: Option<String>,
    pub payments: Option<PayPalPayments>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalOrder {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
    #[serde(default)]
    pub purchase_units: Vec<PayPalPurchaseUnit>,
}

impl PayPalOrder {
    /// Link the buyer must visit to approve the order.
    pub fn approval_link(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve" || l.rel == "payer-action")
            .map(|l| l.href.clone())
    }

    /// Capture id of the first completed capture, if any.
    pub fn capture_id(&self) -> Option<String> {
        self.purchase_units
            .iter()
            .filter_map(|pu| pu.payments.as_ref())
            .flat_map(|p| p.captures.iter())
            .next()
            .map(|c| c.id.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalCycleExecution {
    pub tenure_type: String,
    #[serde(default)]
    pub cycles_completed: i64,
    #[serde(default)]
    pub cycles_remaining: i64,
    #[serde(default)]
    pub total_cycles: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayPalBillingInfo {
    pub next_billing_time: Option<DateTime<Utc>>,
    pub last_payment: Option<PayPalLastPayment>,
    #[serde(default)]
    pub cycle_executions: Vec<PayPalCycleExecution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalLastPayment {
    pub amount: Option<PayPalAmount>,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSubscription {
    pub id: String,
    pub status: String,
    pub plan_id: Option<String>,
    pub custom_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub billing_info: Option<PayPalBillingInfo>,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
}

impl PayPalSubscription {
    pub fn approval_link(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "approve")
            .map(|l| l.href.clone())
    }
}

/// `PAYMENT.SALE.*` webhook resource.
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSale {
    pub id: String,
    pub state: Option<String>,
    pub amount: Option<PayPalSaleAmount>,
    /// Present when the sale belongs to a subscription.
    pub billing_agreement_id: Option<String>,
    pub parent_payment: Option<String>,
    pub custom: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSaleAmount {
    pub total: String,
    pub currency: String,
}

/// `PAYMENT.CAPTURE.COMPLETED` webhook resource.
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalCaptureResource {
    pub id: String,
    pub status: Option<String>,
    pub amount: Option<PayPalAmount>,
    pub custom_id: Option<String>,
    pub supplementary_data: Option<PayPalSupplementaryData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSupplementaryData {
    pub related_ids: Option<PayPalRelatedIds>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalRelatedIds {
    pub order_id: Option<String>,
}

/// `PAYMENT.CAPTURE.REFUNDED` webhook resource (a refund object; the
/// refunded capture is only reachable through the `up` link).
#[derive(Debug, Clone, Deserialize)]
pub struct PayPalRefundResource {
    pub id: String,
    pub status: Option<String>,
    pub amount: Option<PayPalAmount>,
    pub custom_id: Option<String>,
    pub seller_payable_breakdown: Option<PayPalSellerPayableBreakdown>,
    #[serde(default)]
    pub links: Vec<PayPalLink>,
}

impl PayPalRefundResource {
    pub fn capture_id(&self) -> Option<String> {
        self.links
            .iter()
            .find(|l| l.rel == "up")
            .and_then(|l| l.href.rsplit('/').next())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalSellerPayableBreakdown {
    /// Cumulative refunded amount across all refunds of the capture.
    pub total_refunded_amount: Option<PayPalAmount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalWebhookEvent {
    pub id: String,
    pub event_type: String,
    pub resource: serde_json::Value,
    pub create_time: Option<DateTime<Utc>>,
}

/// Headers PayPal attaches to each webhook delivery, required for
/// signature verification.
#[derive(Debug, Clone)]
pub struct PayPalWebhookHeaders {
    pub transmission_id: String,
    pub transmission_time: String,
    pub transmission_sig: String,
    pub cert_url: String,
    pub auth_algo: String,
}

#[derive(Debug, Deserialize)]
struct VerifyWebhookSignatureResponse {
    verification_status: String,
}

#[derive(Clone)]
pub struct PayPalGateway {
    client: Client,
    config: PayPalConfig,
    token: Arc<Mutex<Option<CachedToken>>>,
}

impl PayPalGateway {
    pub fn new(config: PayPalConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            token: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.client_id.is_empty() && !self.config.client_secret.is_empty()
    }

    fn ensure_configured(&self) -> AppResult<()> {
        if !self.is_configured() {
            return Err(AppError::ConfigError(
                "PayPal credentials are not configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Client-credentials token, cached until one minute before expiry.
    async fn access_token(&self) -> AppResult<String> {
        self.ensure_configured()?;

        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref()
            && cached.expires_at > Utc::now()
        {
            return Ok(cached.token.clone());
        }

        let url = format!("{}/v1/oauth2/token", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "PayPal OAuth failed: {body}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        let cached = CachedToken {
            token: token.access_token.clone(),
            expires_at: Utc::now() + Duration::seconds((token.expires_in - 60).max(0)),
        };
        *guard = Some(cached);

        log::info!("PayPal access token refreshed");
        Ok(token.access_token)
    }

    pub async fn create_order(
        &self,
        amount: &str,
        currency: &str,
        description: &str,
        custom_id: &str,
        return_url: &str,
        cancel_url: &str,
    ) -> AppResult<PayPalOrder> {
        let token = self.access_token().await?;
        let url = format!("{}/v2/checkout/orders", self.config.base_url);

        let body = serde_json::json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "amount": {
                    "currency_code": currency.to_uppercase(),
                    "value": amount,
                },
                "description": description,
                "custom_id": custom_id,
            }],
            "application_context": {
                "brand_name": self.config.brand_name,
                "user_action": "PAY_NOW",
                "return_url": return_url,
                "cancel_url": cancel_url,
            },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "Failed to create PayPal order: {body}"
            )));
        }

        let order: PayPalOrder = response.json().await?;
        Ok(order)
    }

    pub async fn capture_order(&self, order_id: &str) -> AppResult<PayPalOrder> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/v2/checkout/orders/{order_id}/capture",
            self.config.base_url
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "Failed to capture PayPal order {order_id}: {body}"
            )));
        }

        let order: PayPalOrder = response.json().await?;
        Ok(order)
    }

    pub async fn create_subscription(
        &self,
        plan_id: &str,
        custom_id: &str,
        return_url: &str,
        cancel_url: &str,
    ) -> AppResult<PayPalSubscription> {
        let token = self.access_token().await?;
        let url = format!("{}/v1/billing/subscriptions", self.config.base_url);

        let body = serde_json::json!({
            "plan_id": plan_id,
            "custom_id": custom_id,
            "application_context": {
                "brand_name": self.config.brand_name,
                "user_action": "SUBSCRIBE_NOW",
                "return_url": return_url,
                "cancel_url": cancel_url,
            },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "Failed to create PayPal subscription: {body}"
            )));
        }

        let sub: PayPalSubscription = response.json().await?;
        Ok(sub)
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> AppResult<PayPalSubscription> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/v1/billing/subscriptions/{subscription_id}",
            self.config.base_url
        );

        let response = self.client.get(&url).bearer_auth(&token).send().await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "Failed to fetch PayPal subscription {subscription_id}: {body}"
            )));
        }

        let sub: PayPalSubscription = response.json().await?;
        Ok(sub)
    }

    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> AppResult<()> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/v1/billing/subscriptions/{subscription_id}/cancel",
            self.config.base_url
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "Failed to cancel PayPal subscription {subscription_id}: {body}"
            )));
        }

        Ok(())
    }

    /// Ask PayPal to verify a webhook delivery against the configured
    /// webhook id. Deliveries that fail verification must be dropped.
    pub async fn verify_webhook_signature(
        &self,
        headers: &PayPalWebhookHeaders,
        raw_event: &serde_json::Value,
    ) -> AppResult<bool> {
        if self.config.webhook_id.is_empty() {
            return Err(AppError::ConfigError(
                "PayPal webhook id is not configured".to_string(),
            ));
        }

        let token = self.access_token().await?;
        let url = format!(
            "{}/v1/notifications/verify-webhook-signature",
            self.config.base_url
        );

        let body = serde_json::json!({
            "transmission_id": headers.transmission_id,
            "transmission_time": headers.transmission_time,
            "transmission_sig": headers.transmission_sig,
            "cert_url": headers.cert_url,
            "auth_algo": headers.auth_algo,
            "webhook_id": self.config.webhook_id,
            "webhook_event": raw_event,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GatewayError(format!(
                "PayPal webhook verification call failed: {body}"
            )));
        }

        let result: VerifyWebhookSignatureResponse = response.json().await?;
        Ok(result.verification_status == "SUCCESS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_link_extraction() {
        let order: PayPalOrder = serde_json::from_value(serde_json::json!({
            "id": "5O190127TN364715T",
            "status": "CREATED",
            "links": [
                { "href": "https://api-m.paypal.com/v2/checkout/orders/5O190127TN364715T", "rel": "self" },
                { "href": "https://www.paypal.com/checkoutnow?token=5O190127TN364715T", "rel": "approve" }
            ]
        }))
        .unwrap();
        assert_eq!(
            order.approval_link().as_deref(),
            Some("https://www.paypal.com/checkoutnow?token=5O190127TN364715T")
        );
    }

    #[test]
    fn test_capture_id_extraction() {
        let order: PayPalOrder = serde_json::from_value(serde_json::json!({
            "id": "5O190127TN364715T",
            "status": "COMPLETED",
            "purchase_units": [{
                "custom_id": "payment:17",
                "payments": {
                    "captures": [{
                        "id": "3C679366HH908993F",
                        "status": "COMPLETED",
                        "amount": { "currency_code": "USD", "value": "49.99" }
                    }]
                }
            }]
        }))
        .unwrap();
        assert_eq!(order.capture_id().as_deref(), Some("3C679366HH908993F"));
    }

    #[test]
    fn test_sale_resource_parses_subscription_reference() {
        let sale: PayPalSale = serde_json::from_value(serde_json::json!({
            "id": "80021663DE681814L",
            "state": "completed",
            "amount": { "total": "9.99", "currency": "USD" },
            "billing_agreement_id": "I-BW452GLLEP1G",
            "custom": "subscription:4"
        }))
        .unwrap();
        assert_eq!(sale.billing_agreement_id.as_deref(), Some("I-BW452GLLEP1G"));
        assert_eq!(sale.amount.unwrap().total, "9.99");
    }

    #[test]
    fn test_unconfigured_gateway_is_rejected() {
        let gw = PayPalGateway::new(PayPalConfig {
            client_id: String::new(),
            client_secret: String::new(),
            base_url: "https://api-m.sandbox.paypal.com".to_string(),
            webhook_id: String::new(),
            brand_name: "LMS".to_string(),
        });
        assert!(!gw.is_configured());
        assert!(gw.ensure_configured().is_err());
    }
}
