//! Forwarder additions (spec §4.7): smart upstream URL composition and the
//! Claude thinking-signature rectifier applied on a same-provider retry.
//!
//! The bulk of the Forwarder (`build_upstream_request`, HTTP/2 fallback,
//! retry/backoff) lives in `proxy_engine`; this module holds the two pure
//! helpers `proxy_engine` calls into, kept free of any upstream-IO
//! dependency so they're unit-testable in isolation.

pub use gproxy_provider_core::net::build_proxy_url;

use gproxy_protocol::claude::count_tokens::types::{BetaContentBlockParam, BetaMessageContent, BetaMessageRole};
use gproxy_protocol::claude::create_message::request::CreateMessageRequestBody;

/// One-shot sanitizer applied before a same-provider retry when the upstream
/// rejects a Claude request with a thinking-signature error (invalid
/// signature, missing signature, or a thinking block expected but not
/// found ahead of a `tool_use` block).
///
/// Drops every `thinking`/`redacted_thinking` block from message content,
/// and clears the top-level `thinking` config entirely when the last
/// assistant message didn't lead with a thinking block but carried a
/// `tool_use` — that shape is what upstream rejects with "Expected
/// thinking ... found tool_use".
pub fn rectify_thinking_signature(body: &mut CreateMessageRequestBody) {
    if should_clear_thinking_config(body) {
        body.thinking = None;
    }

    for message in &mut body.messages {
        if let BetaMessageContent::Blocks(blocks) = &mut message.content {
            blocks.retain(|block| {
                !matches!(
                    block,
                    BetaContentBlockParam::Thinking(_) | BetaContentBlockParam::RedactedThinking(_)
                )
            });
        }
    }
}

fn should_clear_thinking_config(body: &CreateMessageRequestBody) -> bool {
    let Some(last_assistant) = body
        .messages
        .iter()
        .rev()
        .find(|m| m.role == BetaMessageRole::Assistant)
    else {
        return false;
    };
    let BetaMessageContent::Blocks(blocks) = &last_assistant.content else {
        return false;
    };
    let starts_with_thinking = matches!(
        blocks.first(),
        Some(BetaContentBlockParam::Thinking(_)) | Some(BetaContentBlockParam::RedactedThinking(_))
    );
    let has_tool_use = blocks
        .iter()
        .any(|b| matches!(b, BetaContentBlockParam::ToolUse(_)));
    !starts_with_thinking && has_tool_use
}

/// True when an upstream Claude error body should trigger
/// [`rectify_thinking_signature`] and a single same-provider retry.
pub fn is_thinking_signature_error(body: &str) -> bool {
    body.contains("Invalid signature in thinking block")
        || body.contains("signature field required")
        || (body.contains("Expected thinking") && body.contains("found tool_use"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::claude::count_tokens::types::{
        BetaTextBlockParam, BetaTextBlockType, BetaThinkingBlockParam, BetaThinkingBlockType,
        BetaToolUseBlockParam, BetaToolUseBlockType,
    };
    use gproxy_protocol::claude::create_message::request::CreateMessageRequestBody;
    use gproxy_protocol::claude::types::{BetaThinkingConfigParam, Model};
    use std::collections::BTreeMap;

    fn assistant_blocks(blocks: Vec<BetaContentBlockParam>) -> gproxy_protocol::claude::count_tokens::types::BetaMessageParam {
        gproxy_protocol::claude::count_tokens::types::BetaMessageParam {
            role: BetaMessageRole::Assistant,
            content: BetaMessageContent::Blocks(blocks),
        }
    }

    fn base_body() -> CreateMessageRequestBody {
        CreateMessageRequestBody {
            max_tokens: 1024,
            messages: Vec::new(),
            model: Model::Custom("claude-opus-4".to_string()),
            container: None,
            context_management: None,
            mcp_servers: None,
            metadata: None,
            output_config: None,
            output_format: None,
            service_tier: None,
            stop_sequences: None,
            stream: None,
            system: None,
            temperature: None,
            thinking: None,
            tool_choice: None,
            tools: None,
            top_k: None,
            top_p: None,
        }
    }

    #[test]
    fn strips_thinking_blocks() {
        let mut body = base_body();
        body.messages.push(assistant_blocks(vec![
            BetaContentBlockParam::Thinking(BetaThinkingBlockParam {
                signature: "sig".to_string(),
                thinking: "...".to_string(),
                r#type: BetaThinkingBlockType::Thinking,
            }),
            BetaContentBlockParam::Text(BetaTextBlockParam {
                text: "hello".to_string(),
                r#type: BetaTextBlockType::Text,
                cache_control: None,
                citations: None,
            }),
        ]));

        rectify_thinking_signature(&mut body);

        let BetaMessageContent::Blocks(blocks) = &body.messages[0].content else {
            panic!("expected block content");
        };
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], BetaContentBlockParam::Text(_)));
    }

    #[test]
    fn clears_thinking_config_when_tool_use_leads_without_thinking() {
        let mut body = base_body();
        body.thinking = Some(BetaThinkingConfigParam::Enabled { budget_tokens: 2048 });
        body.messages.push(assistant_blocks(vec![BetaContentBlockParam::ToolUse(
            BetaToolUseBlockParam {
                id: "tool_1".to_string(),
                input: BTreeMap::new(),
                name: "lookup".to_string(),
                r#type: BetaToolUseBlockType::ToolUse,
                cache_control: None,
                caller: None,
            },
        )]));

        rectify_thinking_signature(&mut body);

        assert!(body.thinking.is_none());
    }

    #[test]
    fn detects_known_error_phrasings() {
        assert!(is_thinking_signature_error("Invalid signature in thinking block"));
        assert!(is_thinking_signature_error("signature field required"));
        assert!(is_thinking_signature_error("Expected thinking block but found tool_use instead"));
        assert!(!is_thinking_signature_error("rate limit exceeded"));
    }
}
