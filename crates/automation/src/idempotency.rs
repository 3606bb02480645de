use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde_json::Value;

use crate::rule::ActionType;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex")
});

/// Build the idempotency key for an action using the current clock.
pub fn build_idempotency_key(action_type: ActionType, context: &Value, template: Option<&str>) -> String {
    build_idempotency_key_at(action_type, context, template, Utc::now())
}

/// Build the idempotency key for an action as of `now`.
///
/// `{{field}}` is replaced by the top-level context field (`"unknown"` when absent or null)
/// and `{{date}}` by the UTC calendar date. Without a template the key is
/// `<actionType>:<tenantId>:<UTC hour bucket>`.
pub fn build_idempotency_key_at(
    action_type: ActionType,
    context: &Value,
    template: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    match template {
        Some(template) => PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| {
                let name = &caps[1];
                if name == "date" {
                    return now.format("%Y-%m-%d").to_string();
                }
                render(context.get(name))
            })
            .into_owned(),
        None => format!(
            "{}:{}:{}",
            action_type,
            render(context.get("tenantId")),
            now.format("%Y-%m-%dT%H")
        ),
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "unknown".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 27, 5).unwrap()
    }

    #[test]
    fn substitutes_fields_and_date() {
        let ctx = json!({ "cardId": "c-1", "cycle": 3 });
        let key = build_idempotency_key_at(
            ActionType::CreatePurchaseOrder,
            &ctx,
            Some("po:{{cardId}}:{{ cycle }}:{{date}}"),
            at(),
        );
        assert_eq!(key, "po:c-1:3:2024-03-09");
    }

    #[test]
    fn missing_fields_become_unknown() {
        let key = build_idempotency_key_at(
            ActionType::SendEmail,
            &json!({}),
            Some("mail:{{orderId}}"),
            at(),
        );
        assert_eq!(key, "mail:unknown");
    }

    #[test]
    fn default_key_uses_tenant_and_hour_bucket() {
        let key = build_idempotency_key_at(
            ActionType::CreateWorkOrder,
            &json!({ "tenantId": "t-9" }),
            None,
            at(),
        );
        assert_eq!(key, "create_work_order:t-9:2024-03-09T14");
    }
}
