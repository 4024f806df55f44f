//! Provider selection & health (spec §4.3): group filter, format/provider-type
//! compatibility, model-support inference, 1M-context filter, circuit/cost
//! health, priority layering, weighted random choice, atomic concurrency
//! admission, and session-reuse.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use gproxy_storage::snapshot::ProviderRow;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::limits::{parse_tag_set, KeyLimits, ProviderRouting, UserLimits};
use crate::rate_limit::{RateLimitStore, Scope};
use crate::session::{ChainReason, FormatDialect};

/// The spec's `providerType` enum, derived from the teacher's per-channel
/// `ProviderConfig` `kind` tag (see `spec_provider_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Claude,
    ClaudeAuth,
    Codex,
    OpenAiCompatible,
    Gemini,
    GeminiCli,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::ClaudeAuth => "claude-auth",
            Self::Codex => "codex",
            Self::OpenAiCompatible => "openai-compatible",
            Self::Gemini => "gemini",
            Self::GeminiCli => "gemini-cli",
        }
    }

    fn is_anthropic(&self) -> bool {
        matches!(self, Self::Claude | Self::ClaudeAuth)
    }
}

/// Maps the teacher's `ProviderConfig` discriminant (`config_json["kind"]`)
/// onto the spec's smaller `providerType` vocabulary.
pub fn spec_provider_type(kind: &str) -> ProviderType {
    match kind {
        "claude" => ProviderType::Claude,
        "claudecode" => ProviderType::ClaudeAuth,
        "codex" => ProviderType::Codex,
        "geminicli" => ProviderType::GeminiCli,
        "aistudio" | "vertex" | "vertexexpress" | "antigravity" => ProviderType::Gemini,
        // openai, nvidia, deepseek, custom all speak an OpenAI-compatible wire format.
        _ => ProviderType::OpenAiCompatible,
    }
}

fn format_compatible(format: FormatDialect, provider_type: ProviderType) -> bool {
    match format {
        FormatDialect::Claude => provider_type.is_anthropic(),
        FormatDialect::OpenAiResponse => provider_type == ProviderType::Codex,
        FormatDialect::OpenAiChat => provider_type == ProviderType::OpenAiCompatible,
        FormatDialect::Gemini => provider_type == ProviderType::Gemini,
        FormatDialect::GeminiCli => provider_type == ProviderType::GeminiCli,
    }
}

fn model_supported(model: &str, provider_type: ProviderType, routing: &ProviderRouting) -> bool {
    let is_claude_model = model.starts_with("claude-");
    if is_claude_model {
        if provider_type.is_anthropic() {
            return routing.allowed_models.is_empty()
                || routing.allowed_models.iter().any(|m| m.eq_ignore_ascii_case(model));
        }
        return routing.join_claude_pool
            && routing
                .model_redirects
                .get(model)
                .map(|target| target.starts_with("claude-"))
                .unwrap_or(false);
    }

    let explicit_match = routing.allowed_models.iter().any(|m| m.eq_ignore_ascii_case(model))
        || routing.model_redirects.contains_key(model);
    if explicit_match {
        return true;
    }
    if provider_type.is_anthropic() {
        return false;
    }
    routing.allowed_models.is_empty()
}

#[derive(Debug, Clone)]
pub struct FilteredProvider {
    pub provider_id: i64,
    pub name: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone)]
pub struct CandidateExplain {
    pub provider_id: i64,
    pub name: String,
    pub weight: u32,
    pub cost_multiplier: f64,
    pub probability: f64,
}

#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub group: String,
    pub model: String,
    pub candidates: Vec<CandidateExplain>,
    pub filtered: Vec<FilteredProvider>,
}

#[derive(Debug, Clone)]
pub struct SelectedProvider {
    pub provider_id: i64,
    pub name: String,
    pub provider_type: ProviderType,
    pub routing: ProviderRouting,
}

pub struct SelectionOutcome {
    pub provider: Option<SelectedProvider>,
    pub reason: ChainReason,
    pub context: DecisionContext,
}

pub struct ProviderSelector {
    breaker: Arc<CircuitBreaker>,
    rate_limit: Arc<dyn RateLimitStore>,
}

struct EligibleCandidate {
    provider_id: i64,
    name: String,
    provider_type: ProviderType,
    routing: ProviderRouting,
}

impl ProviderSelector {
    pub fn new(breaker: Arc<CircuitBreaker>, rate_limit: Arc<dyn RateLimitStore>) -> Self {
        Self { breaker, rate_limit }
    }

    /// Runs steps 1-8 of the algorithm over a request-scoped snapshot.
    pub async fn select(
        &self,
        providers: &[ProviderRow],
        format: FormatDialect,
        model: &str,
        key_limits: &KeyLimits,
        user_limits: &UserLimits,
        wants_1m_context: bool,
        excluded: &HashSet<i64>,
        session_id: &str,
    ) -> SelectionOutcome {
        let group = key_limits.effective_group(user_limits);
        let user_tags = parse_tag_set(&group);
        let group_is_all = user_tags.iter().any(|t| t == "all");

        let mut filtered = Vec::new();
        let mut eligible = Vec::new();

        for row in providers {
            if excluded.contains(&row.id) || !row.enabled || row.deleted_at.is_some() {
                continue;
            }
            let routing = ProviderRouting::from_json(&row.routing_json);
            let kind = row
                .config_json
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("custom")
                .to_string();
            let provider_type = spec_provider_type(&kind);

            // 1. Group filter (silent).
            if !group_is_all {
                let provider_tags = routing.group_tags();
                if !user_tags.iter().any(|t| provider_tags.contains(t)) {
                    continue;
                }
            }

            // 2. Format compatibility.
            if !format_compatible(format, provider_type) {
                continue;
            }

            // 3. Model support.
            if !model_supported(model, provider_type, &routing) {
                filtered.push(FilteredProvider {
                    provider_id: row.id,
                    name: row.name.clone(),
                    reason: "model_unsupported",
                });
                continue;
            }

            // 4. 1M-context filter.
            if wants_1m_context
                && routing.context_1m_preference == crate::limits::Context1mPreference::Disabled
            {
                filtered.push(FilteredProvider {
                    provider_id: row.id,
                    name: row.name.clone(),
                    reason: "context_1m_disabled",
                });
                continue;
            }

            // 5. Health filter: circuit + per-period cost limits.
            if self.breaker.status(row.id).await.state == CircuitState::Open {
                filtered.push(FilteredProvider {
                    provider_id: row.id,
                    name: row.name.clone(),
                    reason: "circuit_open",
                });
                continue;
            }
            if self.exceeds_cost_limits(row.id, &routing).await {
                filtered.push(FilteredProvider {
                    provider_id: row.id,
                    name: row.name.clone(),
                    reason: "cost_limit_exceeded",
                });
                continue;
            }

            eligible.push(EligibleCandidate {
                provider_id: row.id,
                name: row.name.clone(),
                provider_type,
                routing,
            });
        }

        if eligible.is_empty() {
            warn!(
                event = "selector.no_eligible_providers",
                session_id,
                model,
                group = %group,
                filtered_count = filtered.len()
            );
            return SelectionOutcome {
                provider: None,
                reason: ChainReason::SystemError,
                context: DecisionContext {
                    group,
                    model: model.to_string(),
                    candidates: Vec::new(),
                    filtered,
                },
            };
        }

        // 6. Priority layering: keep only the minimum (most urgent) priority.
        let min_priority = eligible.iter().map(|c| c.routing.priority).min().unwrap();
        eligible.retain(|c| c.routing.priority == min_priority);

        // 7. Sort ascending by cost multiplier, then weighted-random pick.
        eligible.sort_by(|a, b| {
            a.routing
                .cost_multiplier
                .partial_cmp(&b.routing.cost_multiplier)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total_weight: u32 = eligible.iter().map(|c| c.routing.weight).sum();
        let candidates: Vec<CandidateExplain> = eligible
            .iter()
            .map(|c| CandidateExplain {
                provider_id: c.provider_id,
                name: c.name.clone(),
                weight: c.routing.weight,
                cost_multiplier: c.routing.cost_multiplier,
                probability: if total_weight == 0 {
                    1.0 / eligible.len() as f64
                } else {
                    c.routing.weight as f64 / total_weight as f64
                },
            })
            .collect();

        let mut attempt_order = self.weighted_order(&eligible, total_weight);

        // 8. Atomic concurrency admission; retry through remaining candidates.
        while let Some(idx) = attempt_order.pop() {
            let chosen = &eligible[idx];
            let admitted = match chosen.routing.limit_concurrent_sessions {
                Some(limit) => {
                    let owner_key = format!("provider:{}:concurrent", chosen.provider_id);
                    self.rate_limit
                        .try_admit_concurrent(&owner_key, session_id, limit)
                        .await
                        .0
                }
                None => true,
            };
            if admitted {
                return SelectionOutcome {
                    provider: Some(SelectedProvider {
                        provider_id: chosen.provider_id,
                        name: chosen.name.clone(),
                        provider_type: chosen.provider_type,
                        routing: chosen.routing.clone(),
                    }),
                    reason: ChainReason::InitialSelection,
                    context: DecisionContext {
                        group,
                        model: model.to_string(),
                        candidates,
                        filtered,
                    },
                };
            }
            filtered.push(FilteredProvider {
                provider_id: chosen.provider_id,
                name: chosen.name.clone(),
                reason: "concurrent_limit_failed",
            });
        }

        warn!(
            event = "selector.all_candidates_concurrency_limited",
            session_id,
            model,
            group = %group
        );
        SelectionOutcome {
            provider: None,
            reason: ChainReason::ConcurrentLimitFailed,
            context: DecisionContext {
                group,
                model: model.to_string(),
                candidates,
                filtered,
            },
        }
    }

    /// Re-validates a session-bound provider against steps 2-5 and its own
    /// per-period limits, without running layering/weighted selection.
    pub async fn validate_reuse(
        &self,
        provider: &ProviderRow,
        format: FormatDialect,
        model: &str,
        wants_1m_context: bool,
    ) -> Option<SelectedProvider> {
        if !provider.enabled || provider.deleted_at.is_some() {
            return None;
        }
        let routing = ProviderRouting::from_json(&provider.routing_json);
        let kind = provider
            .config_json
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or("custom");
        let provider_type = spec_provider_type(kind);

        if !format_compatible(format, provider_type) {
            return None;
        }
        if !model_supported(model, provider_type, &routing) {
            return None;
        }
        if wants_1m_context
            && routing.context_1m_preference == crate::limits::Context1mPreference::Disabled
        {
            return None;
        }
        if self.breaker.status(provider.id).await.state == CircuitState::Open {
            return None;
        }
        if self.exceeds_cost_limits(provider.id, &routing).await {
            return None;
        }
        Some(SelectedProvider {
            provider_id: provider.id,
            name: provider.name.clone(),
            provider_type,
            routing,
        })
    }

    async fn exceeds_cost_limits(&self, provider_id: i64, routing: &ProviderRouting) -> bool {
        use crate::rate_limit::Period;
        let id = provider_id.to_string();
        let checks = [
            (Period::FiveHour, routing.spend.five_hour),
            (Period::Daily, routing.spend.daily),
            (Period::Weekly, routing.spend.weekly),
            (Period::Monthly, routing.spend.monthly),
            (Period::Total, routing.spend.total),
        ];
        for (period, limit) in checks {
            let Some(limit) = limit else { continue };
            let current = self
                .rate_limit
                .cost_sum(
                    Scope::Provider,
                    &id,
                    period,
                    routing.daily_reset_mode,
                    routing.daily_reset_time.as_deref(),
                )
                .await;
            if current > limit {
                return true;
            }
        }
        false
    }

    /// Returns candidate indices in the order they should be attempted,
    /// last-to-try first (so `.pop()` yields the weighted-random pick, then
    /// falls back through the remaining candidates on concurrency failure).
    fn weighted_order(&self, eligible: &[EligibleCandidate], total_weight: u32) -> Vec<usize> {
        let mut remaining: Vec<usize> = (0..eligible.len()).collect();
        let mut order = Vec::with_capacity(remaining.len());
        let mut rng = rand::rng();
        let mut weight_left = total_weight;
        while !remaining.is_empty() {
            let pick = if weight_left == 0 {
                rng.random_range(0..remaining.len())
            } else {
                let mut roll = rng.random_range(0..weight_left);
                let mut chosen = 0;
                for (pos, &idx) in remaining.iter().enumerate() {
                    let w = eligible[idx].routing.weight.max(1).min(weight_left);
                    if roll < w {
                        chosen = pos;
                        break;
                    }
                    roll -= w;
                    chosen = pos;
                }
                chosen
            };
            let idx = remaining.remove(pick);
            weight_left = weight_left.saturating_sub(eligible[idx].routing.weight);
            order.push(idx);
        }
        order.reverse();
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::InMemoryRateLimitStore;
    use crate::circuit_breaker::BreakerConfig;
    use serde_json::json;
    use time::OffsetDateTime;

    fn row(id: i64, kind: &str, routing: ProviderRouting) -> ProviderRow {
        ProviderRow {
            id,
            name: format!("p{id}"),
            config_json: json!({"kind": kind}),
            routing_json: serde_json::to_value(routing).unwrap(),
            enabled: true,
            deleted_at: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn excludes_circuit_open_provider() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rl = InMemoryRateLimitStore::new();
        let selector = ProviderSelector::new(breaker.clone(), rl);

        let a = row(1, "claude", ProviderRouting { weight: 1, ..Default::default() });
        let b = row(2, "claude", ProviderRouting { weight: 9, ..Default::default() });
        use crate::circuit_breaker::BreakerFeedKind;
        for _ in 0..10 {
            breaker.record_failure(1, BreakerFeedKind::ProviderError).await;
        }

        let outcome = selector
            .select(
                &[a, b],
                FormatDialect::Claude,
                "claude-opus-4",
                &KeyLimits::default(),
                &UserLimits::default(),
                false,
                &HashSet::new(),
                "sess1",
            )
            .await;
        let chosen = outcome.provider.expect("some provider selected");
        assert_eq!(chosen.provider_id, 2);
        assert!(outcome.context.filtered.iter().any(|f| f.provider_id == 1 && f.reason == "circuit_open"));
    }

    #[tokio::test]
    async fn group_filter_excludes_non_matching_tags() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rl = InMemoryRateLimitStore::new();
        let selector = ProviderSelector::new(breaker, rl);

        let p = row(
            1,
            "claude",
            ProviderRouting {
                group_tag: Some("beta".to_string()),
                ..Default::default()
            },
        );
        let key_limits = KeyLimits {
            provider_group: Some("default".to_string()),
            ..Default::default()
        };
        let outcome = selector
            .select(
                &[p],
                FormatDialect::Claude,
                "claude-opus-4",
                &key_limits,
                &UserLimits::default(),
                false,
                &HashSet::new(),
                "sess1",
            )
            .await;
        assert!(outcome.provider.is_none());
    }

    #[test]
    fn spec_provider_type_maps_teacher_kinds() {
        assert_eq!(spec_provider_type("claudecode").as_str(), "claude-auth");
        assert_eq!(spec_provider_type("openai").as_str(), "openai-compatible");
        assert_eq!(spec_provider_type("geminicli").as_str(), "gemini-cli");
    }
}
