use crate::backend::{http_client, image_to_data_url, parse_url, post_json};
use crate::config::VllmConfig;
use crate::error::{AppError, BackendError};
use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const NAME: &str = "vLLM";

/// Any server exposing an OpenAI-compatible `/chat/completions` endpoint.
pub struct VllmBackend {
    client: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: ChoiceMessage,
}

#[derive(Deserialize, Default)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl VllmBackend {
    pub fn new(
        config: &VllmConfig,
        temperature: f64,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        parse_url(NAME, &config.url)?;
        log::debug!("vLLM endpoint: {} (model {})", config.url, config.model);
        Ok(Self {
            client: http_client(NAME, timeout)?,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            temperature,
            max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn describe(&self, image: &Path, prompt: &str) -> Result<String, BackendError> {
        let payload = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ContentPart::Text { text: prompt },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_to_data_url(image)?,
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let body = post_json(NAME, request)?;
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|_| BackendError::InvalidResponse { backend: NAME, body })?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(BackendError::NoChoices { backend: NAME })?;
        Ok(choice
            .message
            .content
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_server::serve_once;
    use tempfile::TempDir;

    fn backend(url: &str, api_key: Option<&str>) -> VllmBackend {
        let config = VllmConfig {
            url: format!("{url}/v1/chat/completions"),
            model: "llava".to_string(),
            api_key: api_key.map(str::to_string),
        };
        VllmBackend::new(&config, 0.2, 32, Duration::from_secs(5)).expect("backend")
    }

    fn image(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("pic.png");
        std::fs::write(&path, b"png").expect("write");
        path
    }

    #[test]
    fn sends_chat_request_with_inline_image_and_bearer_token() {
        let dir = TempDir::new().expect("tempdir");
        let (url, captured) = serve_once(
            200,
            r#"{"choices": [{"message": {"role": "assistant", "content": " A red door. "}}]}"#,
        );

        let text = backend(&url, Some("secret"))
            .describe(&image(&dir), "What is this?")
            .expect("describe");
        assert_eq!(text, "A red door.");

        let request = captured.recv().expect("request");
        assert_eq!(request.request_line, "POST /v1/chat/completions HTTP/1.1");
        assert!(request
            .headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case("authorization: Bearer secret")));

        let payload: serde_json::Value = serde_json::from_str(&request.body).expect("json");
        let content = &payload["messages"][0]["content"];
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "What is this?");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,cG5n");
        assert_eq!(payload["max_tokens"], 32);
    }

    #[test]
    fn no_authorization_header_without_key() {
        let dir = TempDir::new().expect("tempdir");
        let (url, captured) =
            serve_once(200, r#"{"choices": [{"message": {"content": "ok"}}]}"#);

        backend(&url, None).describe(&image(&dir), "p").expect("describe");
        let request = captured.recv().expect("request");
        assert!(!request
            .headers
            .iter()
            .any(|h| h.to_ascii_lowercase().starts_with("authorization:")));
    }

    #[test]
    fn zero_choices_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let (url, _captured) = serve_once(200, r#"{"choices": []}"#);

        let err = backend(&url, None).describe(&image(&dir), "p").unwrap_err();
        assert!(matches!(err, BackendError::NoChoices { .. }));
        assert_eq!(err.to_string(), "vLLM returned no choices");
    }

    #[test]
    fn error_status_carries_code_and_body() {
        let dir = TempDir::new().expect("tempdir");
        let (url, _captured) = serve_once(401, r#"{"error": "bad key"}"#);

        let err = backend(&url, Some("wrong")).describe(&image(&dir), "p").unwrap_err();
        assert_eq!(err.to_string(), r#"vLLM error 401: {"error": "bad key"}"#);
    }
}
