//! Runtime configuration, loaded from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `REDIS_URL` | `redis://localhost:6379` |
//! | `DEDUPE_TTL_SECS` | `300` (at most 30 days) |
//! | `DEDUPE_FAIL_OPEN` | `true` |
//! | `EVENT_CHANNEL_PREFIX` | `loopforge:events` |
//! | `GUARDRAIL_*` | see [`GuardrailPolicy::default`] |
//!
//! A present but unparsable value is an error, never a silent default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use loopforge_automation::GuardrailPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),
}

/// Longest dedupe window accepted from the environment.
pub const MAX_DEDUPE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_dedupe_ttl_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_channel_prefix() -> String {
    "loopforge:events".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub use_persistent_stores: bool,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_dedupe_ttl_secs")]
    pub dedupe_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub dedupe_fail_open: bool,
    #[serde(default = "default_channel_prefix")]
    pub event_channel_prefix: String,
    #[serde(default)]
    pub guardrails: GuardrailPolicy,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            use_persistent_stores: false,
            database_url: None,
            redis_url: default_redis_url(),
            dedupe_ttl_secs: default_dedupe_ttl_secs(),
            dedupe_fail_open: true,
            event_channel_prefix: default_channel_prefix(),
            guardrails: GuardrailPolicy::default(),
        }
    }
}

fn parse<T>(var: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

/// Monetary limits: finite and non-negative.
fn parse_amount(var: &'static str, raw: String) -> Result<f64, ConfigError> {
    let value: f64 = parse(var, raw.clone())?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::Invalid {
            var,
            value: raw,
            reason: "must be a finite, non-negative amount".to_string(),
        });
    }
    Ok(value)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl AutomationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("USE_PERSISTENT_STORES") {
            config.use_persistent_stores = parse("USE_PERSISTENT_STORES", raw)?;
        }
        config.database_url = lookup("DATABASE_URL").filter(|s| !s.trim().is_empty());
        if let Some(raw) = lookup("REDIS_URL") {
            config.redis_url = raw;
        }
        if let Some(raw) = lookup("DEDUPE_TTL_SECS") {
            config.dedupe_ttl_secs = parse("DEDUPE_TTL_SECS", raw.clone())?;
            if config.dedupe_ttl_secs == 0 || config.dedupe_ttl_secs > MAX_DEDUPE_TTL_SECS {
                return Err(ConfigError::Invalid {
                    var: "DEDUPE_TTL_SECS",
                    value: raw,
                    reason: format!("must be between 1 and {MAX_DEDUPE_TTL_SECS}"),
                });
            }
        }
        if let Some(raw) = lookup("DEDUPE_FAIL_OPEN") {
            config.dedupe_fail_open = parse("DEDUPE_FAIL_OPEN", raw)?;
        }
        if let Some(raw) = lookup("EVENT_CHANNEL_PREFIX") {
            config.event_channel_prefix = raw;
        }

        let g = &mut config.guardrails;
        if let Some(raw) = lookup("GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT") {
            g.max_auto_approve_amount = parse_amount("GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_MAX_EXPEDITED_AUTO_APPROVE_AMOUNT") {
            g.max_expedited_auto_approve_amount = parse_amount("GUARDRAIL_MAX_EXPEDITED_AUTO_APPROVE_AMOUNT", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_MAX_ORDERS_PER_SUPPLIER_PER_DAY") {
            g.max_orders_per_supplier_per_day = parse("GUARDRAIL_MAX_ORDERS_PER_SUPPLIER_PER_DAY", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_MAX_ORDER_VALUE_PER_DAY") {
            g.max_order_value_per_day = parse_amount("GUARDRAIL_MAX_ORDER_VALUE_PER_DAY", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_DUAL_APPROVAL_THRESHOLD") {
            g.dual_approval_threshold = parse_amount("GUARDRAIL_DUAL_APPROVAL_THRESHOLD", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_MAX_ACTIONS_PER_TENANT_PER_HOUR") {
            g.max_actions_per_tenant_per_hour = parse("GUARDRAIL_MAX_ACTIONS_PER_TENANT_PER_HOUR", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_MAX_EMAILS_PER_RECIPIENT_PER_HOUR") {
            g.max_emails_per_recipient_per_hour = parse("GUARDRAIL_MAX_EMAILS_PER_RECIPIENT_PER_HOUR", raw)?;
        }
        if let Some(raw) = lookup("GUARDRAIL_ALLOWED_EMAIL_DOMAINS") {
            g.allowed_email_domains = parse_list(&raw);
        }
        if let Some(raw) = lookup("GUARDRAIL_INTERNAL_ONLY_DOMAINS") {
            g.internal_only_domains = parse_list(&raw);
        }

        if config.use_persistent_stores && config.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(config)
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AutomationConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AutomationConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, AutomationConfig::default());
        assert_eq!(config.dedupe_ttl(), Duration::from_secs(300));
        assert!(config.dedupe_fail_open);
        assert!(config.guardrails.allowed_email_domains.is_empty());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("DEDUPE_TTL_SECS", "60"),
            ("DEDUPE_FAIL_OPEN", "false"),
            ("GUARDRAIL_MAX_ORDERS_PER_SUPPLIER_PER_DAY", "2"),
            ("GUARDRAIL_ALLOWED_EMAIL_DOMAINS", "Acme.com, supplier.io,,"),
        ])
        .unwrap();

        assert_eq!(config.dedupe_ttl_secs, 60);
        assert!(!config.dedupe_fail_open);
        assert_eq!(config.guardrails.max_orders_per_supplier_per_day, 2);
        assert_eq!(
            config.guardrails.allowed_email_domains,
            vec!["acme.com".to_string(), "supplier.io".to_string()]
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = load(&[("DEDUPE_FAIL_OPEN", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "DEDUPE_FAIL_OPEN", .. }));

        assert!(load(&[("GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT", "lots")]).is_err());
        assert!(load(&[("DEDUPE_TTL_SECS", "0")]).is_err());
        assert!(load(&[("DEDUPE_TTL_SECS", "18446744073709551615")]).is_err());
        assert!(load(&[("GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT", "NaN")]).is_err());
    }

    #[test]
    fn guardrail_amounts_must_be_finite_and_non_negative() {
        for bad in ["NaN", "inf", "-inf", "-5", "-0.01"] {
            let err = load(&[("GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT", bad)]).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { var: "GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT", .. }),
                "{bad} accepted"
            );
        }
        assert!(load(&[
            ("GUARDRAIL_MAX_AUTO_APPROVE_AMOUNT", "NaN"),
            ("GUARDRAIL_MAX_ORDER_VALUE_PER_DAY", "-5"),
        ])
        .is_err());
        assert!(load(&[("GUARDRAIL_MAX_ORDER_VALUE_PER_DAY", "-5")]).is_err());
        assert!(load(&[("GUARDRAIL_DUAL_APPROVAL_THRESHOLD", "infinity")]).is_err());
        assert!(load(&[("GUARDRAIL_MAX_EXPEDITED_AUTO_APPROVE_AMOUNT", "NaN")]).is_err());

        let config = load(&[("GUARDRAIL_MAX_ORDER_VALUE_PER_DAY", "0")]).unwrap();
        assert_eq!(config.guardrails.max_order_value_per_day, 0.0);
    }

    #[test]
    fn persistent_mode_requires_database_url() {
        assert_eq!(
            load(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
        let config = load(&[
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/loopforge"),
        ])
        .unwrap();
        assert!(config.use_persistent_stores);
    }
}
