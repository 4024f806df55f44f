use gproxy_protocol::gemini::count_tokens::request::{
    CountTokensRequest as GeminiCountTokensRequest,
    CountTokensRequestBody as GeminiCountTokensRequestBody,
};
use gproxy_protocol::gemini::generate_content::request::{
    GenerateContentPath as GeminiGenerateContentPath,
    GenerateContentRequest as GeminiGenerateContentRequest,
    GenerateContentRequestBody as GeminiGenerateContentRequestBody,
};
use gproxy_protocol::openai::count_tokens::request::{
    InputTokenCountRequest as OpenAIInputTokenCountRequest,
    InputTokenCountRequestBody as OpenAIInputTokenCountRequestBody,
};

use crate::generate_content::gemini2openai_response::request::transform_request as transform_generate_content_request;

/// Convert a Gemini count-tokens request into OpenAI's input-tokens request shape.
pub fn transform_request(request: GeminiCountTokensRequest) -> OpenAIInputTokenCountRequest {
    let model = request.path.model.clone();
    let body = body_from_count_tokens(request.body, model.clone());

    let gemini_request = GeminiGenerateContentRequest {
        path: GeminiGenerateContentPath { model },
        body,
    };

    let response_request = transform_generate_content_request(gemini_request);
    let body = response_request.body;

    OpenAIInputTokenCountRequest {
        body: OpenAIInputTokenCountRequestBody {
            model: body.model,
            input: body.input,
            previous_response_id: body.previous_response_id,
            tools: body.tools,
            text: body.text,
            reasoning: body.reasoning,
            truncation: body.truncation,
            instructions: body.instructions,
            conversation: body.conversation,
            tool_choice: body.tool_choice,
            parallel_tool_calls: body.parallel_tool_calls,
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
