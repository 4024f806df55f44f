use gproxy_protocol::claude::count_tokens::request::CountTokensRequest as ClaudeCountTokensRequest;
use gproxy_protocol::claude::create_message::request::{
    CreateMessageRequest as ClaudeCreateMessageRequest,
    CreateMessageRequestBody as ClaudeCreateMessageRequestBody,
};
use gproxy_protocol::claude::types::AnthropicHeaders;
use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensPath as GeminiCountTokensPath, CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};

use crate::generate_content::claude2gemini::request::transform_request as transform_generate_content_request;

/// Convert a Claude count-tokens request into Gemini's count-tokens request shape.
///
/// Gemini's countTokens endpoint has no first-class representation for system
/// instructions, tools or generation config, so the full translated generate-content
/// body is embedded under `generateContentRequest` rather than `contents`.
pub fn transform_request(request: ClaudeCountTokensRequest) -> GeminiCountTokensRequest {
    let create_message_request = ClaudeCreateMessageRequest {
        headers: AnthropicHeaders::default(),
        body: ClaudeCreateMessageRequestBody {
            max_tokens: 0,
            messages: request.body.messages,
            model: request.body.model,
            container: None,
            context_management: request.body.context_management,
            mcp_servers: request.body.mcp_servers,
            metadata: None,
            output_config: request.body.output_config,
            output_format: request.body.output_format,
            service_tier: None,
            stop_sequences: None,
            stream: None,
            system: request.body.system,
            temperature: None,
            thinking: request.body.thinking,
            tool_choice: request.body.tool_choice,
            tools: request.body.tools,
            top_k: None,
            top_p: None,
        },
    };

    let gemini_request = transform_generate_content_request(create_message_request);
    let model = gemini_request.path.model.clone();

    GeminiCountTokensRequest {
        path: GeminiCountTokensPath { model },
        body: GeminiCountTokensRequestBody {
            contents: None,
            generate_content_request: serde_json::to_value(&gemini_request.body).ok(),
        },
    }
}
