//! Smart upstream URL composition.
//!
//! Admin-configured `base_url`s for OpenAI-compatible/custom providers
//! sometimes already include the endpoint root the client is calling
//! (e.g. a base that ends in `/v1/messages`). Joining naively would
//! double that suffix, so the known endpoint roots are matched against
//! the end of the base and, when found, only the request path's tail
//! beyond that root is appended.

const KNOWN_ENDPOINT_ROOTS: &[&str] = &["/responses", "/chat/completions", "/messages", "/models"];

/// Joins `base_url` and `request_path`, collapsing a shared endpoint root
/// instead of concatenating it twice.
pub fn build_proxy_url(base_url: &str, request_path: &str) -> String {
    let base = base_url.trim_end_matches('/');

    for root in KNOWN_ENDPOINT_ROOTS {
        if base.ends_with(root)
            && let Some(pos) = request_path.find(root)
        {
            let suffix = &request_path[pos + root.len()..];
            return format!("{base}{suffix}");
        }
    }

    format!("{base}/{}", request_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_concatenation_when_base_has_no_known_root() {
        assert_eq!(
            build_proxy_url("https://x.com/v1", "/messages"),
            "https://x.com/v1/messages"
        );
    }

    #[test]
    fn collapses_shared_root_with_empty_suffix() {
        assert_eq!(
            build_proxy_url("https://x.com/openai/responses", "/v1/responses"),
            "https://x.com/openai/responses"
        );
    }

    #[test]
    fn collapses_shared_root_and_appends_remaining_suffix() {
        assert_eq!(
            build_proxy_url("https://x.com/api/v1/messages", "/v1/messages/count_tokens"),
            "https://x.com/api/v1/messages/count_tokens"
        );
    }

    #[test]
    fn idempotent_when_reapplied_with_the_same_path() {
        let base = "https://x.com/openai/responses";
        let path = "/v1/responses";
        let once = build_proxy_url(base, path);
        let twice = build_proxy_url(&once, path);
        assert_eq!(once, twice);
    }
}
