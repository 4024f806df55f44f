//! Cost computation from a per-model price table (spec §4.8 "compute cost").
//!
//! Price-table *synchronization* is an external collaborator (spec §1,
//! explicitly out of scope) — this module only consumes whatever table the
//! gateway was handed. Per the non-goal in spec §1 ("does not attempt to
//! bill when the price table is missing — it records the request and
//! proceeds"), every lookup that can't find a model degrades to `None`
//! rather than an error.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use gproxy_transform::middleware::UsageSummary;
use serde::{Deserialize, Serialize};

/// USD cost per token, by token kind. Mirrors the shape most LLM price
/// tables (LiteLLM's `model_prices.json` and vendor pricing pages) publish.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PriceEntry {
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    #[serde(default)]
    pub cache_read_cost_per_token: f64,
    #[serde(default)]
    pub cache_write_cost_per_token: f64,
}

/// Which model name is the billing candidate (spec §3 invariant iv):
/// `original` bills against the pre-redirect model name, `redirected`
/// against the (possibly provider-rewritten) `request.model`. Whichever
/// candidate has no price entry falls back to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingModelSource {
    Original,
    Redirected,
}

/// Hot-swappable price table, keyed by model name. Loaded once per
/// configuration change (spec §9 open question: "load it at most once
/// globally per configuration change" rather than per-request), so an
/// `ArcSwap` read here never touches I/O.
#[derive(Default)]
pub struct PriceTable {
    entries: ArcSwap<HashMap<String, PriceEntry>>,
}

impl PriceTable {
    pub fn new(entries: HashMap<String, PriceEntry>) -> Arc<Self> {
        Arc::new(Self {
            entries: ArcSwap::from_pointee(entries),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(HashMap::new())
    }

    pub fn replace(&self, entries: HashMap<String, PriceEntry>) {
        self.entries.store(Arc::new(entries));
    }

    pub fn lookup(&self, model: &str) -> Option<PriceEntry> {
        self.entries.load().get(model).copied()
    }

    /// Resolves the billing candidate per invariant (iv), then computes
    /// cost. Returns `None` when neither candidate has a price entry — the
    /// gateway proceeds and records the request uncharged rather than
    /// failing it.
    pub fn compute_cost(
        &self,
        original_model: &str,
        request_model: &str,
        source: BillingModelSource,
        usage: &UsageSummary,
        cost_multiplier: f64,
    ) -> Option<f64> {
        let (primary, fallback) = match source {
            BillingModelSource::Original => (original_model, request_model),
            BillingModelSource::Redirected => (request_model, original_model),
        };
        let entry = self
            .lookup(primary)
            .or_else(|| self.lookup(fallback))?;
        Some(cost_for_entry(&entry, usage) * cost_multiplier)
    }
}

fn cost_for_entry(entry: &PriceEntry, usage: &UsageSummary) -> f64 {
    let input = usage.input_tokens.unwrap_or(0) as f64 * entry.input_cost_per_token;
    let output = usage.output_tokens.unwrap_or(0) as f64 * entry.output_cost_per_token;
    let cache_read =
        usage.cache_read_input_tokens.unwrap_or(0) as f64 * entry.cache_read_cost_per_token;
    let cache_write =
        usage.cache_creation_input_tokens.unwrap_or(0) as f64 * entry.cache_write_cost_per_token;
    input + output + cache_read + cache_write
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u32, output: u32) -> UsageSummary {
        UsageSummary {
            input_tokens: Some(input),
            output_tokens: Some(output),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            cache_creation_5m_tokens: None,
            cache_creation_1h_tokens: None,
        }
    }

    #[test]
    fn missing_price_entry_yields_no_charge() {
        let table = PriceTable::empty();
        let cost = table.compute_cost(
            "claude-opus",
            "claude-opus",
            BillingModelSource::Original,
            &usage(100, 50),
            1.0,
        );
        assert_eq!(cost, None);
    }

    #[test]
    fn computes_weighted_cost_with_multiplier() {
        let mut entries = HashMap::new();
        entries.insert(
            "claude-opus".to_string(),
            PriceEntry {
                input_cost_per_token: 0.00001,
                output_cost_per_token: 0.00002,
                ..Default::default()
            },
        );
        let table = PriceTable::new(entries);
        let cost = table
            .compute_cost(
                "claude-opus",
                "claude-opus",
                BillingModelSource::Original,
                &usage(1000, 500),
                2.0,
            )
            .unwrap();
        // (1000*0.00001 + 500*0.00002) * 2.0 = (0.01 + 0.01) * 2.0
        assert!((cost - 0.04).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_other_billing_candidate() {
        let mut entries = HashMap::new();
        entries.insert(
            "claude-opus".to_string(),
            PriceEntry {
                input_cost_per_token: 0.00001,
                output_cost_per_token: 0.00002,
                ..Default::default()
            },
        );
        let table = PriceTable::new(entries);
        // Redirected model has no price entry; falls back to the original.
        let cost = table.compute_cost(
            "claude-opus",
            "provider-internal-name",
            BillingModelSource::Redirected,
            &usage(100, 100),
            1.0,
        );
        assert!(cost.is_some());
    }
}
