use gproxy_protocol::claude::count_tokens::request::{
    CountTokensRequest as ClaudeCountTokensRequest,
    CountTokensRequestBody as ClaudeCountTokensRequestBody,
};
use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::gemini::generate_content::request::{
    GenerateContentPath as GeminiGenerateContentPath,
    GenerateContentRequest as GeminiGenerateContentRequest,
    GenerateContentRequestBody as GeminiGenerateContentRequestBody,
};

use crate::generate_content::gemini2claude::request::transform_request as transform_generate_content_request;

/// Convert a Gemini count-tokens request into Claude's count-tokens request shape.
pub fn transform_request(request: GeminiCountTokensRequest) -> ClaudeCountTokensRequest {
    let model = request.path.model.clone();
    let body = body_from_count_tokens(request.body, model.clone());

    let gemini_request = GeminiGenerateContentRequest {
        path: GeminiGenerateContentPath { model },
        body,
    };

    let claude_request = transform_generate_content_request(gemini_request);

    ClaudeCountTokensRequest {
        headers: claude_request.headers,
        body: ClaudeCountTokensRequestBody {
            messages: claude_request.body.messages,
            model: claude_request.body.model,
            system: claude_request.body.system,
            tools: claude_request.body.tools,
            tool_choice: claude_request.body.tool_choice,
            thinking: claude_request.body.thinking,
            output_config: claude_request.body.output_config,
            output_format: claude_request.body.output_format,
            context_management: claude_request.body.context_management,
            mcp_servers: claude_request.body.mcp_servers,
        },
    }
}

fn body_from_count_tokens(
    body: GeminiCountTokensRequestBody,
    model: String,
) -> GeminiGenerateContentRequestBody {
    if let Some(generate_content_request) = body.generate_content_request
        && let Ok(parsed) =
            serde_json::from_value::<GeminiGenerateContentRequestBody>(generate_content_request)
    {
        return parsed;
    }

    GeminiGenerateContentRequestBody {
        contents: body.contents.unwrap_or_default(),
        model: Some(model),
        tools: None,
        tool_config: None,
        safety_settings: None,
        system_instruction: None,
        generation_config: None,
        cached_content: None,
    }
}
