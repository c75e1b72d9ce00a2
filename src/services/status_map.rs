//! Pure mappings from gateway-reported statuses to the local ledger's
//! status enums. Kept free of IO so every branch is unit-testable.

use crate::entities::{PaymentStatus, SubscriptionStatus};
use crate::external::PayPalBillingInfo;

/// Map a Stripe PaymentIntent status to the ledger status.
pub fn map_stripe_payment_intent_status(
    status: stripe::PaymentIntentStatus,
) -> PaymentStatus {
    use stripe::PaymentIntentStatus as S;
    match status {
        S::RequiresPaymentMethod | S::RequiresConfirmation => PaymentStatus::Pending,
        S::RequiresAction => PaymentStatus::RequiresAction,
        S::Processing | S::RequiresCapture => PaymentStatus::Processing,
        S::Succeeded => PaymentStatus::Succeeded,
        S::Canceled => PaymentStatus::Canceled,
    }
}

/// Map a Stripe subscription status to the local subscription status.
pub fn map_stripe_subscription_status(
    status: stripe::SubscriptionStatus,
) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Incomplete => SubscriptionStatus::Incomplete,
        S::IncompleteExpired => SubscriptionStatus::Expired,
        S::Trialing => SubscriptionStatus::Trialing,
        S::Active => SubscriptionStatus::Active,
        S::PastDue => SubscriptionStatus::PaymentDue,
        S::Canceled => SubscriptionStatus::Canceled,
        S::Unpaid | S::Paused => SubscriptionStatus::Suspended,
    }
}

/// Map a PayPal order status string to the ledger status. Returns `None`
/// for statuses this service does not recognize.
pub fn map_paypal_order_status(status: &str) -> Option<PaymentStatus> {
    match status {
        "CREATED" | "SAVED" => Some(PaymentStatus::Pending),
        "PAYER_ACTION_REQUIRED" => Some(PaymentStatus::RequiresAction),
        "APPROVED" => Some(PaymentStatus::Processing),
        "COMPLETED" => Some(PaymentStatus::Succeeded),
        "VOIDED" => Some(PaymentStatus::Canceled),
        _ => None,
    }
}

/// Whether the subscription is currently consuming a trial cycle.
///
/// PayPal reports `ACTIVE` both during trials and after them; the trial
/// phase is only visible in `billing_info.cycle_executions`.
fn paypal_in_trial(billing_info: Option<&PayPalBillingInfo>) -> bool {
    let Some(info) = billing_info else {
        return false;
    };
    info.cycle_executions
        .first()
        .map(|cycle| {
            cycle.tenure_type == "TRIAL"
                && (cycle.cycles_remaining > 0
                    || (cycle.cycles_completed == 0 && cycle.total_cycles > 0))
        })
        .unwrap_or(false)
}

/// Map a PayPal subscription status string to the local status. Returns
/// `None` for unrecognized statuses; callers keep the current local status
/// and record the raw string.
pub fn map_paypal_subscription_status(
    status: &str,
    billing_info: Option<&PayPalBillingInfo>,
) -> Option<SubscriptionStatus> {
    match status {
        "APPROVAL_PENDING" | "APPROVED" => Some(SubscriptionStatus::PendingApproval),
        "ACTIVE" => {
            if paypal_in_trial(billing_info) {
                Some(SubscriptionStatus::Trialing)
            } else {
                Some(SubscriptionStatus::Active)
            }
        }
        "SUSPENDED" => Some(SubscriptionStatus::Suspended),
        "CANCELLED" => Some(SubscriptionStatus::Canceled),
        "EXPIRED" => Some(SubscriptionStatus::Expired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::PayPalCycleExecution;

    fn billing_info(cycles: Vec<PayPalCycleExecution>) -> PayPalBillingInfo {
        PayPalBillingInfo {
            next_billing_time: None,
            last_payment: None,
            cycle_executions: cycles,
        }
    }

    fn cycle(
        tenure_type: &str,
        completed: i64,
        remaining: i64,
        total: i64,
    ) -> PayPalCycleExecution {
        PayPalCycleExecution {
            tenure_type: tenure_type.to_string(),
            cycles_completed: completed,
            cycles_remaining: remaining,
            total_cycles: total,
        }
    }

    #[test]
    fn test_stripe_payment_intent_mapping() {
        use stripe::PaymentIntentStatus as S;
        assert_eq!(
            map_stripe_payment_intent_status(S::Succeeded),
            PaymentStatus::Succeeded
        );
        assert_eq!(
            map_stripe_payment_intent_status(S::Processing),
            PaymentStatus::Processing
        );
        assert_eq!(
            map_stripe_payment_intent_status(S::RequiresAction),
            PaymentStatus::RequiresAction
        );
        assert_eq!(
            map_stripe_payment_intent_status(S::RequiresPaymentMethod),
            PaymentStatus::Pending
        );
        assert_eq!(
            map_stripe_payment_intent_status(S::Canceled),
            PaymentStatus::Canceled
        );
    }

    #[test]
    fn test_stripe_subscription_mapping() {
        use stripe::SubscriptionStatus as S;
        assert_eq!(
            map_stripe_subscription_status(S::PastDue),
            SubscriptionStatus::PaymentDue
        );
        assert_eq!(
            map_stripe_subscription_status(S::Unpaid),
            SubscriptionStatus::Suspended
        );
        assert_eq!(
            map_stripe_subscription_status(S::IncompleteExpired),
            SubscriptionStatus::Expired
        );
        assert_eq!(
            map_stripe_subscription_status(S::Trialing),
            SubscriptionStatus::Trialing
        );
    }

    #[test]
    fn test_paypal_order_mapping() {
        assert_eq!(
            map_paypal_order_status("CREATED"),
            Some(PaymentStatus::Pending)
        );
        assert_eq!(
            map_paypal_order_status("APPROVED"),
            Some(PaymentStatus::Processing)
        );
        assert_eq!(
            map_paypal_order_status("COMPLETED"),
            Some(PaymentStatus::Succeeded)
        );
        assert_eq!(map_paypal_order_status("SOMETHING_NEW"), None);
    }

    #[test]
    fn test_paypal_active_with_trial_cycle_is_trialing() {
        let info = billing_info(vec![cycle("TRIAL", 0, 1, 1)]);
        assert_eq!(
            map_paypal_subscription_status("ACTIVE", Some(&info)),
            Some(SubscriptionStatus::Trialing)
        );
    }

    #[test]
    fn test_paypal_active_with_exhausted_trial_is_active() {
        // Trial cycle fully consumed: remaining 0, completed 1
        let info = billing_info(vec![cycle("TRIAL", 1, 0, 1)]);
        assert_eq!(
            map_paypal_subscription_status("ACTIVE", Some(&info)),
            Some(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn test_paypal_active_with_regular_cycle_is_active() {
        let info = billing_info(vec![cycle("REGULAR", 3, 0, 0)]);
        assert_eq!(
            map_paypal_subscription_status("ACTIVE", Some(&info)),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            map_paypal_subscription_status("ACTIVE", None),
            Some(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn test_paypal_terminal_and_unknown_statuses() {
        assert_eq!(
            map_paypal_subscription_status("CANCELLED", None),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(
            map_paypal_subscription_status("EXPIRED", None),
            Some(SubscriptionStatus::Expired)
        );
        assert_eq!(
            map_paypal_subscription_status("SUSPENDED", None),
            Some(SubscriptionStatus::Suspended)
        );
        assert_eq!(map_paypal_subscription_status("SOMETHING_NEW", None), None);
    }
}
