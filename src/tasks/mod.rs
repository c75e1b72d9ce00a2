//! Background scheduled tasks for the application.
//!
//! Two recurring jobs: re-running failed webhook deliveries, and closing
//! out subscriptions the gateways stop sending events for. Call
//! `spawn_all` once during startup to launch them.

use crate::services::{SubscriptionService, WebhookService};

/// Spawn all background tasks.
///
/// Notes
/// - Each task is idempotent as implemented in its service and runs on its
///   own schedule.
/// - This function detaches tasks via `tokio::spawn`; it does not block.
pub fn spawn_all(webhook_service: WebhookService, subscription_service: SubscriptionService) {
    // Webhook重试队列（每分钟）
    {
        let svc = webhook_service.clone();
        tokio::spawn(async move {
            loop {
                match svc.process_due_retries().await {
                    Ok(n) if n > 0 => log::info!("Webhook retries processed: {n}"),
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to process webhook retries: {e:?}"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        });
    }

    // 订阅过期检查（每 6 小时）
    {
        let svc = subscription_service.clone();
        tokio::spawn(async move {
            loop {
                match svc.expire_overdue_subscriptions().await {
                    Ok(n) if n > 0 => log::info!("Overdue subscriptions closed: {n}"),
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to expire subscriptions: {e:?}"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(6 * 3600)).await;
            }
        });
    }
}
