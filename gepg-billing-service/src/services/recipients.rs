//! Recipient resolution for notification deliveries.
//!
//! Pure policy logic: given the customer and payer contact addresses and
//! the configured toggles, decide who receives the document, or why
//! nobody does. Malformed addresses are dropped, never fatal.

use crate::config::DeliveryConfig;
use validator::ValidateEmail;

pub const REASON_NO_VALID_RECIPIENT: &str = "no-valid-recipient";
pub const REASON_POLICY_DISALLOWED: &str = "policy-disallowed";

/// Outcome of recipient resolution: either a de-duplicated recipient list
/// or a suppression reason suitable for the delivery audit trail.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    Recipients(Vec<String>),
    Suppressed(&'static str),
}

/// Resolve recipients for a delivery event.
///
/// The customer address is used when the customer channel is enabled. The
/// payer address only matters once a payment exists; when it diverges from
/// the customer address it is included only if the divergent-payer toggle
/// allows, otherwise the whole delivery is suppressed as disallowed.
pub fn resolve(
    policy: &DeliveryConfig,
    customer_email: Option<&str>,
    payer_email: Option<&str>,
) -> Resolution {
    let customer = customer_email.filter(|e| e.validate_email());
    let payer = payer_email.filter(|e| e.validate_email());

    let mut recipients: Vec<String> = Vec::new();

    if policy.customer_enabled {
        if let Some(addr) = customer {
            recipients.push(addr.to_string());
        }
    }

    if let Some(addr) = payer {
        let diverges = customer.map(|c| !c.eq_ignore_ascii_case(addr)).unwrap_or(true);
        if diverges && !policy.allow_divergent_payer {
            if recipients.is_empty() && policy.payer_enabled {
                return Resolution::Suppressed(REASON_POLICY_DISALLOWED);
            }
        } else if policy.payer_enabled {
            let duplicate = recipients.iter().any(|r| r.eq_ignore_ascii_case(addr));
            if !duplicate {
                recipients.push(addr.to_string());
            }
        }
    }

    if recipients.is_empty() {
        Resolution::Suppressed(REASON_NO_VALID_RECIPIENT)
    } else {
        Resolution::Recipients(recipients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(customer: bool, payer: bool, divergent: bool) -> DeliveryConfig {
        DeliveryConfig {
            customer_enabled: customer,
            payer_enabled: payer,
            allow_divergent_payer: divergent,
            max_attempts: 5,
            retry_base_secs: 60,
            worker_count: 1,
            queue_size: 16,
        }
    }

    #[test]
    fn customer_address_is_used_by_default() {
        let r = resolve(&policy(true, false, false), Some("a@example.com"), None);
        assert_eq!(r, Resolution::Recipients(vec!["a@example.com".to_string()]));
    }

    #[test]
    fn missing_or_invalid_address_suppresses_with_reason() {
        let r = resolve(&policy(true, false, false), None, None);
        assert_eq!(r, Resolution::Suppressed(REASON_NO_VALID_RECIPIENT));

        let r = resolve(&policy(true, false, false), Some("not-an-email"), None);
        assert_eq!(r, Resolution::Suppressed(REASON_NO_VALID_RECIPIENT));
    }

    #[test]
    fn malformed_input_never_panics() {
        let r = resolve(&policy(true, true, true), Some(""), Some("@@@"));
        assert_eq!(r, Resolution::Suppressed(REASON_NO_VALID_RECIPIENT));
    }

    #[test]
    fn payer_channel_disabled_by_default() {
        let r = resolve(
            &policy(true, false, false),
            Some("a@example.com"),
            Some("a@example.com"),
        );
        assert_eq!(r, Resolution::Recipients(vec!["a@example.com".to_string()]));
    }

    #[test]
    fn matching_payer_is_deduplicated() {
        let r = resolve(
            &policy(true, true, false),
            Some("a@example.com"),
            Some("A@EXAMPLE.COM"),
        );
        assert_eq!(r, Resolution::Recipients(vec!["a@example.com".to_string()]));
    }

    #[test]
    fn divergent_payer_disallowed_suppresses_when_payer_is_only_channel() {
        let r = resolve(&policy(false, true, false), None, Some("p@example.com"));
        assert_eq!(r, Resolution::Suppressed(REASON_POLICY_DISALLOWED));
    }

    #[test]
    fn divergent_payer_allowed_adds_both() {
        let r = resolve(
            &policy(true, true, true),
            Some("a@example.com"),
            Some("p@example.com"),
        );
        assert_eq!(
            r,
            Resolution::Recipients(vec![
                "a@example.com".to_string(),
                "p@example.com".to_string()
            ])
        );
    }

    #[test]
    fn divergent_payer_disallowed_still_reaches_customer() {
        let r = resolve(
            &policy(true, true, false),
            Some("a@example.com"),
            Some("p@example.com"),
        );
        assert_eq!(r, Resolution::Recipients(vec!["a@example.com".to_string()]));
    }
}
