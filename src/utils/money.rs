/// Currencies whose smallest unit is the major unit itself.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

pub fn is_zero_decimal_currency(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str())
}

/// Convert a major-unit price (e.g. 49.99) to the integer amount the
/// gateways charge (4999 cents). Rounded, not truncated, so 19.99 * 100
/// does not come out as 1998.
pub fn amount_in_smallest_unit(amount: f64, currency: &str) -> i64 {
    if is_zero_decimal_currency(currency) {
        amount.round() as i64
    } else {
        (amount * 100.0).round() as i64
    }
}

/// Inverse of [`amount_in_smallest_unit`], for display purposes only.
pub fn amount_from_smallest_unit(amount: i64, currency: &str) -> f64 {
    if is_zero_decimal_currency(currency) {
        amount as f64
    } else {
        amount as f64 / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_decimal_currencies_use_cents() {
        assert_eq!(amount_in_smallest_unit(49.99, "usd"), 4999);
        assert_eq!(amount_in_smallest_unit(50.0, "USD"), 5000);
        assert_eq!(amount_in_smallest_unit(0.0, "eur"), 0);
    }

    #[test]
    fn test_float_representation_rounds_correctly() {
        // 19.99 is not exactly representable; naive truncation yields 1998
        assert_eq!(amount_in_smallest_unit(19.99, "usd"), 1999);
        assert_eq!(amount_in_smallest_unit(0.29, "usd"), 29);
    }

    #[test]
    fn test_zero_decimal_currencies() {
        assert_eq!(amount_in_smallest_unit(500.0, "jpy"), 500);
        assert_eq!(amount_in_smallest_unit(500.0, "JPY"), 500);
        assert!(is_zero_decimal_currency("krw"));
        assert!(!is_zero_decimal_currency("usd"));
    }

    #[test]
    fn test_round_trip() {
        assert_eq!(amount_from_smallest_unit(4999, "usd"), 49.99);
        assert_eq!(amount_from_smallest_unit(500, "jpy"), 500.0);
    }
}
