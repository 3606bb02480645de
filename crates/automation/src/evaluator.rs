//! RuleEvaluator: deny-first, priority-ordered, pure.
//!
//! Decision:
//! 1. any matching deny rule denies, citing the highest-precedence one;
//! 2. otherwise no matching allow rule denies (implicit default-deny);
//! 3. otherwise the best allow match wins: lowest priority number, then most conditions.

use std::cmp::Ordering;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::rule::{AutomationRule, Condition, ConditionOperator, RuleType};

/// Outcome of evaluating a rule set against one trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    pub allowed: bool,
    /// The deciding rule: the deny rule that blocked, or the selected allow rule.
    pub matched_rule: Option<AutomationRule>,
    pub reason: String,
    pub evaluated_rules: usize,
    pub matched_allow_rules: usize,
    pub matched_deny_rules: usize,
}

/// Safe dot-path descent into `context`. `None` on any missing or non-object segment.
pub fn resolve_field<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.')
        .try_fold(context, |current, segment| current.as_object()?.get(segment))
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => actual == expected,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let a = actual?.as_f64()?;
    let b = expected.as_f64()?;
    a.partial_cmp(&b)
}

fn regex_subject(actual: Option<&Value>) -> Option<String> {
    match actual? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Evaluate a single condition. Never panics; type mismatches evaluate to `false`.
pub fn evaluate_condition(condition: &Condition, context: &Value) -> bool {
    let actual = resolve_field(context, &condition.field);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Eq => actual.is_some_and(|a| values_equal(a, expected)),
        ConditionOperator::Neq => !actual.is_some_and(|a| values_equal(a, expected)),
        ConditionOperator::Gt => compare_numbers(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::Gte => matches!(
            compare_numbers(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lt => compare_numbers(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Lte => matches!(
            compare_numbers(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOperator::In => match (expected.as_array(), actual) {
            (Some(items), Some(a)) => items.iter().any(|item| values_equal(a, item)),
            _ => false,
        },
        ConditionOperator::NotIn => match expected.as_array() {
            Some(items) => !actual.is_some_and(|a| items.iter().any(|item| values_equal(a, item))),
            None => false,
        },
        ConditionOperator::Exists => {
            let present = actual.is_some_and(|v| !v.is_null());
            if expected == &Value::Bool(false) { !present } else { present }
        }
        ConditionOperator::Regex => {
            let (Some(pattern), Some(subject)) = (expected.as_str(), regex_subject(actual)) else {
                return false;
            };
            Regex::new(pattern).is_ok_and(|re| re.is_match(&subject))
        }
    }
}

pub fn rule_matches(rule: &AutomationRule, context: &Value) -> bool {
    rule.conditions.iter().all(|c| evaluate_condition(c, context))
}

/// Evaluate `rules` for `trigger_event` against `context`.
pub fn evaluate_rules(rules: &[AutomationRule], trigger_event: &str, context: &Value) -> RuleEvaluation {
    let mut candidates: Vec<&AutomationRule> = rules
        .iter()
        .filter(|r| r.is_active && r.trigger.event == trigger_event)
        .collect();
    candidates.sort_by_key(|r| r.priority);

    let matching: Vec<&AutomationRule> = candidates
        .iter()
        .copied()
        .filter(|r| rule_matches(r, context))
        .collect();

    let denies: Vec<&AutomationRule> = matching
        .iter()
        .copied()
        .filter(|r| r.rule_type == RuleType::Deny)
        .collect();
    let allows: Vec<&AutomationRule> = matching
        .iter()
        .copied()
        .filter(|r| r.rule_type == RuleType::Allow)
        .collect();

    let evaluated_rules = candidates.len();
    let matched_allow_rules = allows.len();
    let matched_deny_rules = denies.len();

    if let Some(deny) = denies.first() {
        return RuleEvaluation {
            allowed: false,
            matched_rule: Some((*deny).clone()),
            reason: format!("denied by rule '{}'", deny.id),
            evaluated_rules,
            matched_allow_rules,
            matched_deny_rules,
        };
    }

    let best = allows.iter().copied().min_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| b.conditions.len().cmp(&a.conditions.len()))
    });

    match best {
        Some(rule) => RuleEvaluation {
            allowed: true,
            matched_rule: Some(rule.clone()),
            reason: format!("allowed by rule '{}'", rule.id),
            evaluated_rules,
            matched_allow_rules,
            matched_deny_rules,
        },
        None => RuleEvaluation {
            allowed: false,
            matched_rule: None,
            reason: format!("no allow rule matched '{trigger_event}' (default deny)"),
            evaluated_rules,
            matched_allow_rules,
            matched_deny_rules,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{ActionType, RuleAction, Trigger};
    use proptest::prelude::*;
    use serde_json::json;

    fn cond(field: &str, operator: ConditionOperator, value: Value) -> Condition {
        Condition {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn rule(id: &str, rule_type: RuleType, priority: i32, conditions: Vec<Condition>) -> AutomationRule {
        AutomationRule {
            id: id.to_string(),
            name: id.to_string(),
            rule_type,
            category: None,
            trigger: Trigger {
                event: "card.triggered".to_string(),
                source_entity: Some("card".to_string()),
            },
            conditions,
            action: RuleAction {
                action_type: ActionType::CreatePurchaseOrder,
                idempotency_key_template: None,
                timeout_ms: 1_000,
            },
            approval: Default::default(),
            fallback: Default::default(),
            priority,
            is_active: true,
            tenant_configurable: false,
        }
    }

    fn ctx() -> Value {
        json!({
            "tenantId": "t-1",
            "loop": { "loopType": "procurement", "isActive": false },
            "order": { "totalAmount": 1500, "supplierId": "s-9" },
            "card": { "stage": "triggered", "tags": null }
        })
    }

    #[test]
    fn resolve_field_descends_objects_only() {
        let c = ctx();
        assert_eq!(resolve_field(&c, "loop.loopType"), Some(&json!("procurement")));
        assert_eq!(resolve_field(&c, "loop.loopType.x"), None);
        assert_eq!(resolve_field(&c, "missing.deep"), None);
        assert_eq!(resolve_field(&c, ""), None);
    }

    #[test]
    fn comparison_operators_require_numbers() {
        let c = ctx();
        assert!(evaluate_condition(&cond("order.totalAmount", ConditionOperator::Gt, json!(1000)), &c));
        assert!(evaluate_condition(&cond("order.totalAmount", ConditionOperator::Lte, json!(1500.0)), &c));
        assert!(!evaluate_condition(&cond("order.totalAmount", ConditionOperator::Gt, json!("1000")), &c));
        assert!(!evaluate_condition(&cond("loop.loopType", ConditionOperator::Lt, json!(3)), &c));
        assert!(evaluate_condition(&cond("order.totalAmount", ConditionOperator::Eq, json!(1500.0)), &c));
    }

    #[test]
    fn membership_and_existence() {
        let c = ctx();
        let kinds = json!(["procurement", "transfer"]);
        assert!(evaluate_condition(&cond("loop.loopType", ConditionOperator::In, kinds.clone()), &c));
        assert!(!evaluate_condition(&cond("loop.loopType", ConditionOperator::NotIn, kinds), &c));
        assert!(!evaluate_condition(&cond("loop.loopType", ConditionOperator::In, json!("procurement")), &c));

        assert!(evaluate_condition(&cond("order.supplierId", ConditionOperator::Exists, json!(true)), &c));
        assert!(!evaluate_condition(&cond("card.tags", ConditionOperator::Exists, Value::Null), &c));
        assert!(evaluate_condition(&cond("card.owner", ConditionOperator::Exists, json!(false)), &c));
    }

    #[test]
    fn invalid_regex_is_false_not_a_panic() {
        let c = ctx();
        assert!(evaluate_condition(&cond("order.supplierId", ConditionOperator::Regex, json!("^s-\\d+$")), &c));
        assert!(!evaluate_condition(&cond("order.supplierId", ConditionOperator::Regex, json!("([")), &c));
        assert!(!evaluate_condition(&cond("loop", ConditionOperator::Regex, json!(".*")), &c));
    }

    #[test]
    fn deny_beats_allow_regardless_of_priority() {
        let rules = vec![
            rule("allow-procurement", RuleType::Allow, 1, vec![cond("loop.loopType", ConditionOperator::Eq, json!("procurement"))]),
            rule("deny-inactive-loop", RuleType::Deny, 100, vec![cond("loop.isActive", ConditionOperator::Eq, json!(false))]),
        ];

        let result = evaluate_rules(&rules, "card.triggered", &ctx());
        assert!(!result.allowed);
        assert_eq!(result.matched_rule.unwrap().id, "deny-inactive-loop");
        assert_eq!(result.matched_allow_rules, 1);
        assert_eq!(result.matched_deny_rules, 1);
    }

    #[test]
    fn no_allow_match_is_default_deny() {
        let rules = vec![rule("allow-transfer", RuleType::Allow, 1, vec![cond("loop.loopType", ConditionOperator::Eq, json!("transfer"))])];
        let result = evaluate_rules(&rules, "card.triggered", &ctx());
        assert!(!result.allowed);
        assert!(result.matched_rule.is_none());
        assert_eq!(result.evaluated_rules, 1);
    }

    #[test]
    fn equal_priority_prefers_more_specific_rule() {
        let rules = vec![
            rule("broad", RuleType::Allow, 5, vec![cond("loop.loopType", ConditionOperator::Eq, json!("procurement"))]),
            rule("specific", RuleType::Allow, 5, vec![
                cond("loop.loopType", ConditionOperator::Eq, json!("procurement")),
                cond("order.totalAmount", ConditionOperator::Lt, json!(5000)),
            ]),
        ];
        let result = evaluate_rules(&rules, "card.triggered", &ctx());
        assert!(result.allowed);
        assert_eq!(result.matched_rule.unwrap().id, "specific");
    }

    #[test]
    fn other_events_and_inactive_rules_are_ignored() {
        let mut inactive = rule("inactive-deny", RuleType::Deny, 0, vec![]);
        inactive.is_active = false;
        let mut other = rule("other-event-deny", RuleType::Deny, 0, vec![]);
        other.trigger.event = "order.created".to_string();
        let rules = vec![inactive, other, rule("allow-all", RuleType::Allow, 9, vec![])];

        let result = evaluate_rules(&rules, "card.triggered", &ctx());
        assert!(result.allowed);
        assert_eq!(result.evaluated_rules, 1);
    }

    proptest! {
        /// Property: a matching deny rule decides the outcome whatever priorities are involved.
        #[test]
        fn any_matching_deny_denies(allow_priority in -100i32..100, deny_priority in -100i32..100) {
            let rules = vec![
                rule("a", RuleType::Allow, allow_priority, vec![]),
                rule("d", RuleType::Deny, deny_priority, vec![]),
            ];
            let result = evaluate_rules(&rules, "card.triggered", &ctx());
            prop_assert!(!result.allowed);
            prop_assert_eq!(result.matched_rule.map(|r| r.id), Some("d".to_string()));
        }
    }
}
