//! Seed data for the provider rows bootstrap inserts on first run.
//!
//! Each seed is disabled by default: an admin enables a provider once its
//! credentials are configured, mirroring how `register_builtin_providers`
//! only wires up the dispatch implementation, not usability.

use serde_json::{Value as JsonValue, json};

pub struct BuiltinProviderSeed {
    pub name: &'static str,
    pub config_json: JsonValue,
    pub enabled: bool,
}

fn seed(kind: &'static str) -> BuiltinProviderSeed {
    BuiltinProviderSeed {
        name: kind,
        config_json: json!({ "kind": kind, "channel_settings": {} }),
        enabled: false,
    }
}

/// Builtin provider rows seeded into storage on bootstrap when missing.
///
/// `custom` is intentionally absent: it has no sensible default
/// (`base_url`/`dispatch` are required), so it is only ever created by an
/// admin explicitly.
pub fn builtin_provider_seeds() -> Vec<BuiltinProviderSeed> {
    vec![
        seed("openai"),
        seed("claude"),
        seed("aistudio"),
        seed("vertexexpress"),
        seed("vertex"),
        seed("geminicli"),
        seed("claudecode"),
        seed("codex"),
        seed("antigravity"),
        seed("nvidia"),
        seed("deepseek"),
    ]
}
