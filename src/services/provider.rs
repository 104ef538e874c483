use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::models::task::TaskInput;

/// How the executor talks to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderMode {
    /// Ask the chat endpoint first, fall back to the image endpoint.
    #[default]
    ConversationalFirst,
    DirectOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProviderErrorKind {
    QuotaExceeded,
    InvalidCredential,
    RateLimited,
    Timeout,
    Network,
    Unknown,
}

impl ProviderErrorKind {
    /// Message stored on the failed task and shown to the user.
    pub fn user_message(self) -> &'static str {
        match self {
            ProviderErrorKind::QuotaExceeded => {
                "The image service has run out of quota. Please try again later."
            }
            ProviderErrorKind::InvalidCredential => {
                "The image service rejected our credentials. Please contact support."
            }
            ProviderErrorKind::RateLimited => {
                "The image service is busy right now. Please retry in a minute."
            }
            ProviderErrorKind::Timeout => "Image generation took too long and was stopped.",
            ProviderErrorKind::Network => "Could not reach the image service. Please retry.",
            ProviderErrorKind::Unknown => "Image generation failed. Please try again.",
        }
    }

    /// Errors after which asking the same provider another way is pointless.
    pub fn is_fatal_for_attempt(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::QuotaExceeded | ProviderErrorKind::InvalidCredential
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind} provider error: {detail}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub detail: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        Self::new(classify_status(status, body), format!("HTTP {status}: {}", truncate(body, 300)))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            ProviderErrorKind::Timeout
        } else if e.is_connect() {
            ProviderErrorKind::Network
        } else if let Some(status) = e.status() {
            classify_status(status, "")
        } else if e.is_request() || e.is_body() {
            ProviderErrorKind::Network
        } else {
            ProviderErrorKind::Unknown
        };
        Self::new(kind, e.to_string())
    }
}

/// Map an HTTP error status and body to an error kind.
pub fn classify_status(status: StatusCode, body: &str) -> ProviderErrorKind {
    let body = body.to_ascii_lowercase();
    let mentions_quota = ["quota", "billing", "insufficient_funds", "credit balance"]
        .iter()
        .any(|needle| body.contains(needle));

    match status.as_u16() {
        401 | 403 => ProviderErrorKind::InvalidCredential,
        402 => ProviderErrorKind::QuotaExceeded,
        429 if mentions_quota => ProviderErrorKind::QuotaExceeded,
        429 => ProviderErrorKind::RateLimited,
        408 | 504 => ProviderErrorKind::Timeout,
        502 | 503 => ProviderErrorKind::Network,
        _ if mentions_quota => ProviderErrorKind::QuotaExceeded,
        _ => ProviderErrorKind::Unknown,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// External image generation service.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Conversational call; the locator has to be extracted from the reply text.
    async fn converse(&self, input: &TaskInput) -> Result<String, ProviderError>;

    /// Dedicated generation call returning a locator directly.
    async fn generate(&self, input: &TaskInput) -> Result<String, ProviderError>;
}

/// Client for an OpenAI-compatible HTTP API.
pub struct ImageApiClient {
    http: Client,
    base_url: String,
    api_key: String,
    chat_model: String,
    image_model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: String,
    n: u8,
    size: &'static str,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Deserialize)]
struct ImageDatum {
    url: Option<String>,
}

const SYSTEM_PROMPT: &str = concat!(
    "You are an image generation assistant. Generate exactly one image for the ",
    "request and reply with the direct URL of the generated image."
);

impl ImageApiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        chat_model: &str,
        image_model: &str,
    ) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .user_agent(concat!("imagegen-tasks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Unknown, e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            chat_model: chat_model.to_string(),
            image_model: image_model.to_string(),
        })
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        Ok(response.json::<R>().await?)
    }
}

/// Prompt text with style and aspect ratio folded in.
pub fn compose_prompt(input: &TaskInput) -> String {
    let mut prompt = input.prompt.trim().to_string();
    if prompt.is_empty() {
        prompt.push_str("A variation of the reference image");
    }
    if let Some(style) = &input.style {
        prompt.push_str(&format!(". Style: {style}"));
    }
    if let Some(ratio) = input.aspect_ratio {
        prompt.push_str(&format!(". Aspect ratio: {ratio}"));
    }
    prompt
}

#[async_trait]
impl GenerationProvider for ImageApiClient {
    async fn converse(&self, input: &TaskInput) -> Result<String, ProviderError> {
        let text = compose_prompt(input);
        let user_content = match &input.reference_image {
            Some(reference) => serde_json::json!([
                { "type": "text", "text": text },
                { "type": "image_url", "image_url": { "url": reference } }
            ]),
            None => serde_json::Value::String(text),
        };

        let request = ChatRequest {
            model: &self.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: serde_json::Value::String(SYSTEM_PROMPT.to_string()),
                },
                ChatMessage {
                    role: "user",
                    content: user_content,
                },
            ],
        };

        let response: ChatResponse = self.post("/chat/completions", &request).await?;
        response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Unknown, "empty chat reply"))
    }

    async fn generate(&self, input: &TaskInput) -> Result<String, ProviderError> {
        let request = ImageRequest {
            model: &self.image_model,
            prompt: compose_prompt(input),
            n: 1,
            size: input.aspect_ratio.unwrap_or(crate::models::task::AspectRatio::Square).image_size(),
        };

        let response: ImageResponse = self.post("/images/generations", &request).await?;
        response
            .data
            .into_iter()
            .find_map(|datum| datum.url)
            .ok_or_else(|| {
                ProviderError::new(ProviderErrorKind::Unknown, "image response had no url")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::AspectRatio;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ProviderErrorKind::InvalidCredential
        );
        assert_eq!(
            classify_status(StatusCode::PAYMENT_REQUIRED, ""),
            ProviderErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            ProviderErrorKind::RateLimited
        );
        assert_eq!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                r#"{"error":{"code":"insufficient_quota"}}"#
            ),
            ProviderErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify_status(StatusCode::GATEWAY_TIMEOUT, ""),
            ProviderErrorKind::Timeout
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ProviderErrorKind::QuotaExceeded.is_fatal_for_attempt());
        assert!(!ProviderErrorKind::Network.is_fatal_for_attempt());
    }

    #[test]
    fn test_compose_prompt() {
        let mut input = TaskInput::from_prompt("  a red bicycle ");
        input.style = Some("watercolor".into());
        input.aspect_ratio = Some(AspectRatio::Landscape);
        assert_eq!(
            compose_prompt(&input),
            "a red bicycle. Style: watercolor. Aspect ratio: 16:9"
        );
    }

    #[test]
    fn test_mode_parses_from_config_value() {
        use std::str::FromStr;
        assert_eq!(
            ProviderMode::from_str("direct_only").unwrap(),
            ProviderMode::DirectOnly
        );
        assert_eq!(ProviderMode::default(), ProviderMode::ConversationalFirst);
    }

    #[test]
    fn test_user_messages_are_distinct() {
        let kinds = [
            ProviderErrorKind::QuotaExceeded,
            ProviderErrorKind::InvalidCredential,
            ProviderErrorKind::RateLimited,
            ProviderErrorKind::Timeout,
            ProviderErrorKind::Network,
            ProviderErrorKind::Unknown,
        ];
        let mut messages: Vec<_> = kinds.iter().map(|k| k.user_message()).collect();
        messages.dedup();
        assert_eq!(messages.len(), kinds.len());
    }
}
