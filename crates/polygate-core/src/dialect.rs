//! Wire protocol dialects understood by the gateway.
//!
//! Each dialect has a canonical JSON request shape, a non-streaming response
//! shape, and an SSE event shape. Translation between dialects lives in the
//! `polygate-translate` crate.

use serde::{Deserialize, Serialize};

/// Supported client/provider wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    OpenaiChat,
    OpenaiResponses,
    AnthropicMessages,
    GeminiV1beta,
}

impl Dialect {
    /// Canonical endpoint path for this dialect on the provider side.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Dialect::OpenaiChat => "/v1/chat/completions",
            Dialect::OpenaiResponses => "/v1/responses",
            Dialect::AnthropicMessages => "/v1/messages",
            Dialect::GeminiV1beta => "/v1beta/models",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::OpenaiChat => "openai-chat",
            Dialect::OpenaiResponses => "openai-responses",
            Dialect::AnthropicMessages => "anthropic-messages",
            Dialect::GeminiV1beta => "gemini-v1beta",
        }
    }

    /// Parse a `provider-type` config value into the dialect that provider
    /// speaks natively. Only values with an implemented upstream dialect are
    /// accepted.
    pub fn from_provider_type(s: &str) -> Option<Dialect> {
        match s {
            "claude" | "anthropic" => Some(Dialect::AnthropicMessages),
            "openai" => Some(Dialect::OpenaiChat),
            "gemini" => Some(Dialect::GeminiV1beta),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_display() {
        assert_eq!(Dialect::OpenaiChat.to_string(), "openai-chat");
        assert_eq!(Dialect::GeminiV1beta.to_string(), "gemini-v1beta");
    }

    #[test]
    fn test_dialect_endpoint_path() {
        assert_eq!(Dialect::AnthropicMessages.endpoint_path(), "/v1/messages");
        assert_eq!(Dialect::OpenaiChat.endpoint_path(), "/v1/chat/completions");
    }

    #[test]
    fn test_dialect_serde_kebab_case() {
        let d: Dialect = serde_json::from_str("\"anthropic-messages\"").unwrap();
        assert_eq!(d, Dialect::AnthropicMessages);
        assert_eq!(
            serde_json::to_string(&Dialect::OpenaiResponses).unwrap(),
            "\"openai-responses\""
        );
    }

    #[test]
    fn test_from_provider_type() {
        assert_eq!(
            Dialect::from_provider_type("claude"),
            Some(Dialect::AnthropicMessages)
        );
        assert_eq!(Dialect::from_provider_type("bedrock"), None);
    }
}
