pub mod agent_pool;
pub mod bootstrap;
pub mod circuit_breaker;
pub mod error_rules;
pub mod finalize;
pub mod forwarder;
pub mod guard;
pub mod limits;
pub mod pricing;
pub mod probe;
pub mod proxy_engine;
pub mod rate_limit;
pub mod response_fixer;
pub mod selector;
pub mod session;
pub mod state;
pub mod upstream_client;

pub use agent_pool::{AgentPool, AgentPoolConfig, HttpVersion};
pub use circuit_breaker::{BreakerConfig, BreakerFeedKind, BreakerStatus, CircuitBreaker, CircuitState};
pub use error_rules::{
    classify, is_provider_error_status, mask_sensitive, ErrorKind, ErrorRule, ErrorRuleEngine,
    ProxyError,
};
pub use finalize::{finalize_request, FinalizeContext};
pub use pricing::{BillingModelSource, PriceEntry, PriceTable};
pub use guard::{
    auth_guard, client_guard, message_context_guard, model_guard, probe_guard, provider_guard,
    rate_limit_guard, run_pipeline, sensitive_word_guard, session_guard, warmup_guard,
    FilterAction, FilterScope, GuardOutcome, GuardPipelineResources, GuardPreset, GuardResponse,
    GuardStep, MatchType, RequestFilter,
};
pub use limits::{Context1mPreference, DailyResetMode, KeyLimits, ProviderRouting, SpendLimits, UserLimits};
pub use rate_limit::{
    check_twelve_steps, InMemoryRateLimitStore, Period, RateLimitError, RateLimitStore,
    RedisRateLimitStore, Scope,
};
pub use response_fixer::{is_terminal_chunk, ResponseFixer};
pub use selector::{ProviderSelector, ProviderType, SelectedProvider, SelectionOutcome};
pub use session::{
    generate_deterministic_session_id, AuthState, AuthenticatedKey, AuthenticatedUser, ChainReason,
    FormatDialect, ProviderChainItem, Session, SessionError,
};
