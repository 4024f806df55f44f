//! Typed views over the `limits_json`/`routing_json` blobs stored on
//! `UserRow`, `UserKeyRow`, and `ProviderRow`.
//!
//! Runtime code never touches raw `serde_json::Value` for these — it decodes
//! once per snapshot read via `from_json` (defaulting on parse failure, since
//! the blob is operator-editable admin state, not wire input).

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyResetMode {
    Fixed,
    Rolling,
}

impl Default for DailyResetMode {
    fn default() -> Self {
        Self::Fixed
    }
}

/// Per-period USD spend caps. Any field left `None` is unenforced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpendLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "five_hour")]
    pub five_hour: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserLimits {
    #[serde(default)]
    pub spend: SpendLimits,
    /// `HH:mm`, local to the gateway process.
    #[serde(default = "default_daily_reset_time")]
    pub daily_reset_time: String,
    #[serde(default)]
    pub daily_reset_mode: DailyResetMode,
    #[serde(default)]
    pub rpm: Option<u32>,
    /// Comma-separated provider group tags, e.g. `"default,beta"`.
    #[serde(default)]
    pub provider_group: Option<String>,
    /// Substring patterns matched against `User-Agent` (case-insensitive).
    #[serde(default)]
    pub allowed_clients: Vec<String>,
    /// Exact, case-insensitive model allow-list. Empty = all models allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

fn default_daily_reset_time() -> String {
    "00:00".to_string()
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            spend: SpendLimits::default(),
            daily_reset_time: default_daily_reset_time(),
            daily_reset_mode: DailyResetMode::default(),
            rpm: None,
            provider_group: None,
            allowed_clients: Vec::new(),
            allowed_models: Vec::new(),
            expires_at: None,
        }
    }
}

impl UserLimits {
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyLimits {
    #[serde(default)]
    pub spend: SpendLimits,
    #[serde(default)]
    pub limit_concurrent_sessions: Option<u32>,
    /// Overrides the owning user's `provider_group` when set.
    #[serde(default)]
    pub provider_group: Option<String>,
}

impl Default for KeyLimits {
    fn default() -> Self {
        Self {
            spend: SpendLimits::default(),
            limit_concurrent_sessions: None,
            provider_group: None,
        }
    }
}

impl KeyLimits {
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// `key.provider_group ?? user.provider_group ?? "default"`.
    pub fn effective_group(&self, user: &UserLimits) -> String {
        self.provider_group
            .clone()
            .or_else(|| user.provider_group.clone())
            .unwrap_or_else(|| "default".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Context1mPreference {
    Inherit,
    ForceEnable,
    Disabled,
}

impl Default for Context1mPreference {
    fn default() -> Self {
        Self::Inherit
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderRouting {
    #[serde(default)]
    pub group_tag: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub model_redirects: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub join_claude_pool: bool,
    #[serde(default)]
    pub context_1m_preference: Context1mPreference,
    #[serde(default)]
    pub spend: SpendLimits,
    #[serde(default)]
    pub daily_reset_time: Option<String>,
    #[serde(default)]
    pub daily_reset_mode: DailyResetMode,
    #[serde(default)]
    pub streaming_idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_timeout_non_streaming_ms: Option<u64>,
    #[serde(default)]
    pub limit_concurrent_sessions: Option<u32>,
}

fn default_cost_multiplier() -> f64 {
    1.0
}

impl Default for ProviderRouting {
    fn default() -> Self {
        Self {
            group_tag: None,
            priority: 100,
            weight: 1,
            cost_multiplier: default_cost_multiplier(),
            allowed_models: Vec::new(),
            model_redirects: std::collections::HashMap::new(),
            join_claude_pool: false,
            context_1m_preference: Context1mPreference::default(),
            spend: SpendLimits::default(),
            daily_reset_time: None,
            daily_reset_mode: DailyResetMode::default(),
            streaming_idle_timeout_ms: None,
            request_timeout_non_streaming_ms: None,
            limit_concurrent_sessions: None,
        }
    }
}

impl ProviderRouting {
    pub fn from_json(value: &JsonValue) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Comma-separated group tags this provider carries, defaulting to `default`
    /// when no tag is set (mirrors the empty-`groupTag` rule in the selector).
    pub fn group_tags(&self) -> Vec<String> {
        match &self.group_tag {
            Some(tags) if !tags.trim().is_empty() => tags
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            _ => vec!["default".to_string()],
        }
    }
}

/// Parses a comma-separated tag set, lower-cased and de-duplicated in order.
pub fn parse_tag_set(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_limits_falls_back_to_user_group_then_default() {
        let user = UserLimits {
            provider_group: Some("alpha".to_string()),
            ..Default::default()
        };
        let key = KeyLimits::default();
        assert_eq!(key.effective_group(&user), "alpha");

        let user_no_group = UserLimits::default();
        assert_eq!(key.effective_group(&user_no_group), "default");

        let key_override = KeyLimits {
            provider_group: Some("beta".to_string()),
            ..Default::default()
        };
        assert_eq!(key_override.effective_group(&user), "beta");
    }

    #[test]
    fn provider_routing_defaults_group_tag_to_default() {
        let routing = ProviderRouting::default();
        assert_eq!(routing.group_tags(), vec!["default".to_string()]);

        let tagged = ProviderRouting {
            group_tag: Some(" Pro , beta ".to_string()),
            ..Default::default()
        };
        assert_eq!(tagged.group_tags(), vec!["pro".to_string(), "beta".to_string()]);
    }

    #[test]
    fn parse_tag_set_dedupes_and_lowercases() {
        assert_eq!(
            parse_tag_set("All, Default, all"),
            vec!["all".to_string(), "default".to_string()]
        );
    }
}
