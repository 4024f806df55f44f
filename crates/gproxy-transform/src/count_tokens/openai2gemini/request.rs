use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensPath as GeminiCountTokensPath, CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::openai::count_tokens::request::InputTokenCountRequest as OpenAIInputTokenCountRequest;
use gproxy_protocol::openai::create_response::request::{
    CreateResponseRequest as OpenAIResponseRequest,
    CreateResponseRequestBody as OpenAIResponseRequestBody,
};

use crate::generate_content::openai_response2gemini::request::transform_request as transform_generate_content_request;

/// Convert an OpenAI input-tokens request into Gemini's count-tokens request shape.
///
/// Gemini's countTokens endpoint has no first-class representation for instructions,
/// tools or reasoning config, so the full translated generate-content body is embedded
/// under `generateContentRequest` rather than `contents`.
pub fn transform_request(request: OpenAIInputTokenCountRequest) -> GeminiCountTokensRequest {
    let response_request = OpenAIResponseRequest {
        body: OpenAIResponseRequestBody {
            model: request.body.model,
            input: request.body.input,
            include: None,
            parallel_tool_calls: request.body.parallel_tool_calls,
            store: None,
            instructions: request.body.instructions,
            stream: None,
            stream_options: None,
            conversation: request.body.conversation,
            previous_response_id: request.body.previous_response_id,
            reasoning: request.body.reasoning,
            context_management: None,
            background: None,
            max_output_tokens: None,
            max_tool_calls: None,
            text: request.body.text,
            tools: request.body.tools,
            tool_choice: request.body.tool_choice,
            prompt: None,
            truncation: request.body.truncation,
            top_logprobs: None,
            metadata: None,
            temperature: None,
            top_p: None,
            user: None,
            safety_identifier: None,
            prompt_cache_key: None,
            service_tier: None,
            prompt_cache_retention: None,
        },
    };

    let gemini_request = transform_generate_content_request(response_request);
    let model = gemini_request.path.model.clone();

    GeminiCountTokensRequest {
        path: GeminiCountTokensPath { model },
        body: GeminiCountTokensRequestBody {
            contents: None,
            generate_content_request: serde_json::to_value(&gemini_request.body).ok(),
        },
    }
}
