//! Guardrail policy and the pure checks over counter snapshots.
//!
//! The engine in `loopforge-infra` reads the counters; the decisions live here so they can
//! be tested without a store.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MAX_AUTO_APPROVE_AMOUNT: &str = "max_auto_approve_amount";
pub const MAX_EXPEDITED_AUTO_APPROVE_AMOUNT: &str = "max_expedited_auto_approve_amount";
pub const MAX_ORDERS_PER_SUPPLIER_PER_DAY: &str = "max_orders_per_supplier_per_day";
pub const MAX_ORDER_VALUE_PER_DAY: &str = "max_order_value_per_day";
pub const MAX_ACTIONS_PER_TENANT_PER_HOUR: &str = "max_actions_per_tenant_per_hour";
pub const EMAIL_ADDRESS_INVALID: &str = "email_address_invalid";
pub const EMAIL_DOMAIN_NOT_ALLOWED: &str = "email_domain_not_allowed";
pub const DUPLICATE_EMAIL: &str = "duplicate_email";
pub const INTERNAL_ONLY_DOMAIN: &str = "internal_only_domain";
pub const MAX_EMAILS_PER_RECIPIENT_PER_HOUR: &str = "max_emails_per_recipient_per_hour";

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

/// Per-tenant limits. Deserialized from configuration with per-field defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GuardrailPolicy {
    pub max_auto_approve_amount: f64,
    pub max_expedited_auto_approve_amount: f64,
    pub max_orders_per_supplier_per_day: u32,
    pub max_order_value_per_day: f64,
    /// Informational: flags `requires_dual_approval`, never blocks.
    pub dual_approval_threshold: f64,
    /// Shared by financial and outbound actions.
    pub max_actions_per_tenant_per_hour: u32,
    pub max_emails_per_recipient_per_hour: u32,
    /// Empty blocks every outbound message.
    pub allowed_email_domains: Vec<String>,
    pub internal_only_domains: Vec<String>,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            max_auto_approve_amount: 5_000.0,
            max_expedited_auto_approve_amount: 10_000.0,
            max_orders_per_supplier_per_day: 5,
            max_order_value_per_day: 50_000.0,
            dual_approval_threshold: 10_000.0,
            max_actions_per_tenant_per_hour: 100,
            max_emails_per_recipient_per_hour: 3,
            allowed_email_domains: Vec::new(),
            internal_only_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailViolation {
    pub guardrail_id: String,
    pub description: String,
    pub current_value: f64,
    pub threshold: f64,
}

impl GuardrailViolation {
    fn new(id: &str, description: impl Into<String>, current_value: f64, threshold: f64) -> Self {
        Self {
            guardrail_id: id.to_string(),
            description: description.into(),
            current_value,
            threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailCheckResult {
    pub passed: bool,
    pub violations: Vec<GuardrailViolation>,
    #[serde(default)]
    pub requires_dual_approval: bool,
}

impl GuardrailCheckResult {
    fn from_violations(violations: Vec<GuardrailViolation>, requires_dual_approval: bool) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
            requires_dual_approval,
        }
    }
}

/// An order-creation action under check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderGuardrailInput {
    #[serde(default)]
    pub supplier_id: Option<String>,
    pub total_amount: f64,
    #[serde(default)]
    pub is_expedited: bool,
}

/// Counter values as of the check.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FinancialCounters {
    pub supplier_orders_today: f64,
    pub tenant_order_value_today: f64,
    pub tenant_actions_this_hour: f64,
}

/// Financial guardrails. Every check runs; violations are collected.
pub fn evaluate_financial(
    policy: &GuardrailPolicy,
    input: &OrderGuardrailInput,
    counters: FinancialCounters,
) -> GuardrailCheckResult {
    let mut violations = Vec::new();

    let (limit_id, limit) = if input.is_expedited {
        (MAX_EXPEDITED_AUTO_APPROVE_AMOUNT, policy.max_expedited_auto_approve_amount)
    } else {
        (MAX_AUTO_APPROVE_AMOUNT, policy.max_auto_approve_amount)
    };
    if input.total_amount > limit {
        violations.push(GuardrailViolation::new(
            limit_id,
            format!("order amount {} exceeds auto-approve limit {}", input.total_amount, limit),
            input.total_amount,
            limit,
        ));
    }

    if input.supplier_id.is_some() {
        let limit = f64::from(policy.max_orders_per_supplier_per_day);
        if counters.supplier_orders_today >= limit {
            violations.push(GuardrailViolation::new(
                MAX_ORDERS_PER_SUPPLIER_PER_DAY,
                "supplier has reached its daily order limit",
                counters.supplier_orders_today,
                limit,
            ));
        }
    }

    let projected_value = counters.tenant_order_value_today + input.total_amount;
    if projected_value > policy.max_order_value_per_day {
        violations.push(GuardrailViolation::new(
            MAX_ORDER_VALUE_PER_DAY,
            "cumulative order value would exceed the daily limit",
            projected_value,
            policy.max_order_value_per_day,
        ));
    }

    if let Some(v) = tenant_hourly_cap(policy, counters.tenant_actions_this_hour) {
        violations.push(v);
    }

    GuardrailCheckResult::from_violations(
        violations,
        input.total_amount >= policy.dual_approval_threshold,
    )
}

/// An outbound notification under check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundGuardrailInput {
    pub recipient: String,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OutboundCounters {
    /// Same (order, recipient) already sent within the hour.
    pub duplicate_sent: bool,
    pub recipient_sent_this_hour: f64,
    pub tenant_actions_this_hour: f64,
}

/// Lowercased domain of a syntactically valid address.
pub fn recipient_domain(address: &str) -> Option<String> {
    let address = address.trim();
    if !EMAIL.is_match(address) {
        return None;
    }
    address.rsplit_once('@').map(|(_, domain)| domain.to_ascii_lowercase())
}

fn domain_listed(domain: &str, list: &[String]) -> bool {
    list.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        domain == entry || domain.ends_with(&format!(".{entry}"))
    })
}

/// Outbound guardrails in order. An invalid address short-circuits; the rest are collected.
pub fn evaluate_outbound(
    policy: &GuardrailPolicy,
    input: &OutboundGuardrailInput,
    counters: OutboundCounters,
) -> GuardrailCheckResult {
    let Some(domain) = recipient_domain(&input.recipient) else {
        return GuardrailCheckResult::from_violations(
            vec![GuardrailViolation::new(
                EMAIL_ADDRESS_INVALID,
                format!("'{}' is not a valid email address", input.recipient),
                0.0,
                0.0,
            )],
            false,
        );
    };

    let mut violations = Vec::new();

    if !domain_listed(&domain, &policy.allowed_email_domains) {
        violations.push(GuardrailViolation::new(
            EMAIL_DOMAIN_NOT_ALLOWED,
            format!("domain '{domain}' is not on the tenant allow-list"),
            0.0,
            policy.allowed_email_domains.len() as f64,
        ));
    }

    if counters.duplicate_sent {
        violations.push(GuardrailViolation::new(
            DUPLICATE_EMAIL,
            "same order was sent to this recipient within the last hour",
            1.0,
            1.0,
        ));
    }

    if domain_listed(&domain, &policy.internal_only_domains) {
        violations.push(GuardrailViolation::new(
            INTERNAL_ONLY_DOMAIN,
            format!("domain '{domain}' is internal-only"),
            1.0,
            0.0,
        ));
    }

    let per_recipient = f64::from(policy.max_emails_per_recipient_per_hour);
    if counters.recipient_sent_this_hour >= per_recipient {
        violations.push(GuardrailViolation::new(
            MAX_EMAILS_PER_RECIPIENT_PER_HOUR,
            "recipient has reached its hourly email limit",
            counters.recipient_sent_this_hour,
            per_recipient,
        ));
    }

    if let Some(v) = tenant_hourly_cap(policy, counters.tenant_actions_this_hour) {
        violations.push(v);
    }

    GuardrailCheckResult::from_violations(violations, false)
}

fn tenant_hourly_cap(policy: &GuardrailPolicy, actions_this_hour: f64) -> Option<GuardrailViolation> {
    let limit = f64::from(policy.max_actions_per_tenant_per_hour);
    (actions_this_hour >= limit).then(|| {
        GuardrailViolation::new(
            MAX_ACTIONS_PER_TENANT_PER_HOUR,
            "tenant has reached its hourly automation action limit",
            actions_this_hour,
            limit,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GuardrailPolicy {
        GuardrailPolicy {
            allowed_email_domains: vec!["acme.com".to_string()],
            internal_only_domains: vec!["internal.acme.com".to_string()],
            ..GuardrailPolicy::default()
        }
    }

    fn order(amount: f64) -> OrderGuardrailInput {
        OrderGuardrailInput {
            supplier_id: Some("s-1".to_string()),
            total_amount: amount,
            is_expedited: false,
        }
    }

    #[test]
    fn supplier_daily_limit_reports_current_and_threshold() {
        let result = evaluate_financial(
            &policy(),
            &order(100.0),
            FinancialCounters {
                supplier_orders_today: 5.0,
                ..Default::default()
            },
        );
        assert!(!result.passed);
        assert_eq!(result.violations.len(), 1);
        let v = &result.violations[0];
        assert_eq!(v.guardrail_id, MAX_ORDERS_PER_SUPPLIER_PER_DAY);
        assert_eq!(v.current_value, 5.0);
        assert_eq!(v.threshold, 5.0);
    }

    #[test]
    fn financial_violations_are_collected() {
        let result = evaluate_financial(
            &policy(),
            &order(8_000.0),
            FinancialCounters {
                supplier_orders_today: 0.0,
                tenant_order_value_today: 45_000.0,
                tenant_actions_this_hour: 100.0,
            },
        );
        let ids: Vec<&str> = result.violations.iter().map(|v| v.guardrail_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![MAX_AUTO_APPROVE_AMOUNT, MAX_ORDER_VALUE_PER_DAY, MAX_ACTIONS_PER_TENANT_PER_HOUR]
        );
    }

    #[test]
    fn expedited_orders_use_higher_limit_and_dual_approval_only_flags() {
        let mut input = order(9_000.0);
        input.is_expedited = true;
        let result = evaluate_financial(&policy(), &input, FinancialCounters::default());
        assert!(result.passed);
        assert!(!result.requires_dual_approval);

        let result = evaluate_financial(&policy(), &order(12_000.0), FinancialCounters::default());
        assert!(!result.passed);
        assert!(result.requires_dual_approval);
    }

    #[test]
    fn invalid_address_short_circuits() {
        let input = OutboundGuardrailInput {
            recipient: "not an address".to_string(),
            order_id: None,
        };
        let counters = OutboundCounters {
            duplicate_sent: true,
            recipient_sent_this_hour: 10.0,
            tenant_actions_this_hour: 1_000.0,
        };
        let result = evaluate_outbound(&policy(), &input, counters);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].guardrail_id, EMAIL_ADDRESS_INVALID);
    }

    #[test]
    fn empty_allow_list_blocks_everything() {
        let policy = GuardrailPolicy::default();
        for recipient in ["buyer@acme.com", "ops@supplier.io", "x@y.org"] {
            let input = OutboundGuardrailInput {
                recipient: recipient.to_string(),
                order_id: None,
            };
            let result = evaluate_outbound(&policy, &input, OutboundCounters::default());
            assert!(!result.passed, "{recipient} must be blocked");
            assert_eq!(result.violations[0].guardrail_id, EMAIL_DOMAIN_NOT_ALLOWED);
        }
    }

    #[test]
    fn outbound_checks_collect_in_order() {
        let input = OutboundGuardrailInput {
            recipient: "Ops@Internal.Acme.com".to_string(),
            order_id: Some("po-1".to_string()),
        };
        let counters = OutboundCounters {
            duplicate_sent: true,
            recipient_sent_this_hour: 3.0,
            tenant_actions_this_hour: 0.0,
        };
        let result = evaluate_outbound(&policy(), &input, counters);
        let ids: Vec<&str> = result.violations.iter().map(|v| v.guardrail_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![DUPLICATE_EMAIL, INTERNAL_ONLY_DOMAIN, MAX_EMAILS_PER_RECIPIENT_PER_HOUR]
        );
    }

    #[test]
    fn allowed_domain_passes() {
        let input = OutboundGuardrailInput {
            recipient: "buyer@acme.com".to_string(),
            order_id: Some("po-1".to_string()),
        };
        assert!(evaluate_outbound(&policy(), &input, OutboundCounters::default()).passed);
    }
}
