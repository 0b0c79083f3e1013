//! URL helpers shared by the model client and the SSE transport.

/// Removes surrounding whitespace and trailing slashes.
///
/// ```
/// use toolweave::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url(" https://api.example.com/v1/ "), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Joins a base URL and an endpoint path with exactly one slash.
///
/// ```
/// use toolweave::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalize_base_url(base_url), endpoint)
}

/// Normalizes `base_url` and drops a trailing `suffix` path, so that both
/// `http://host/mcp` and `http://host/mcp/sse` yield `http://host/mcp`.
pub fn strip_path_suffix(base_url: &str, suffix: &str) -> String {
    let normalized = normalize_base_url(base_url);
    match normalized.strip_suffix(suffix) {
        Some(stripped) => stripped.to_string(),
        None => normalized,
    }
}

/// Resolves an endpoint announced by a server: absolute URLs are kept,
/// paths are joined to `base_url`.
pub fn resolve_endpoint(base_url: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        construct_api_url(base_url, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_slashes_and_whitespace() {
        assert_eq!(normalize_base_url("http://localhost:3000///"), "http://localhost:3000");
        assert_eq!(normalize_base_url("http://localhost:3000"), "http://localhost:3000");
        assert_eq!(normalize_base_url("///"), "");
    }

    #[test]
    fn construct_api_url_joins_once() {
        assert_eq!(
            construct_api_url("https://api.openai.com/v1", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            construct_api_url("http://127.0.0.1:9/v1//", "///chat/completions"),
            "http://127.0.0.1:9/v1/chat/completions"
        );
    }

    #[test]
    fn strip_path_suffix_only_removes_trailing_segment() {
        assert_eq!(strip_path_suffix("http://host:1/mcp/sse/", "/sse"), "http://host:1/mcp");
        assert_eq!(strip_path_suffix("http://host:1/mcp", "/sse"), "http://host:1/mcp");
        assert_eq!(strip_path_suffix("http://host:1/sse/extra", "/sse"), "http://host:1/sse/extra");
    }

    #[test]
    fn resolve_endpoint_handles_relative_and_absolute() {
        let base = "http://localhost:3000";
        assert_eq!(
            resolve_endpoint(base, "/message?sessionId=1"),
            "http://localhost:3000/message?sessionId=1"
        );
        assert_eq!(
            resolve_endpoint(base, " message?sessionId=1\n"),
            "http://localhost:3000/message?sessionId=1"
        );
        assert_eq!(
            resolve_endpoint(base, "https://other.example/m?sessionId=2"),
            "https://other.example/m?sessionId=2"
        );
    }
}
