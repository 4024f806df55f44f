use std::sync::Arc;

use gproxy_provider_core::ProviderRegistry;

use crate::providers::{
    AIStudioProvider, AntigravityProvider, ClaudeCodeProvider, ClaudeProvider, CodexProvider,
    CustomProvider, DeepSeekProvider, GeminiCliProvider, NvidiaProvider, OpenAIProvider,
    VertexExpressProvider, VertexProvider,
};

/// Registers every builtin `UpstreamProvider` implementation by name.
///
/// `custom` is registered too: unlike the builtin seed list, a registered
/// `CustomProvider` implementation is needed the moment an admin creates a
/// `custom`-kind provider row, which happens without a restart.
pub fn register_builtin_providers(registry: &mut ProviderRegistry) {
    registry.register(Arc::new(OpenAIProvider::new()));
    registry.register(Arc::new(ClaudeProvider::new()));
    registry.register(Arc::new(AIStudioProvider::new()));
    registry.register(Arc::new(VertexExpressProvider::new()));
    registry.register(Arc::new(VertexProvider::new()));
    registry.register(Arc::new(GeminiCliProvider::new()));
    registry.register(Arc::new(ClaudeCodeProvider::new()));
    registry.register(Arc::new(CodexProvider::new()));
    registry.register(Arc::new(AntigravityProvider::new()));
    registry.register(Arc::new(NvidiaProvider::new()));
    registry.register(Arc::new(DeepSeekProvider::new()));
    registry.register(Arc::new(CustomProvider::new()));
}
