use crate::backend::{http_client, image_to_base64, parse_url, post_json};
use crate::config::OllamaConfig;
use crate::error::{AppError, BackendError};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const NAME: &str = "Ollama";
const GENERATE_PATH: &str = "/api/generate";

/// Local generation server speaking the `/api/generate` protocol.
pub struct OllamaBackend {
    client: Client,
    url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaBackend {
    pub fn new(
        config: &OllamaConfig,
        temperature: f64,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let url = generate_url(&config.url);
        parse_url(NAME, &url)?;
        log::debug!("Ollama endpoint: {} (model {})", url, config.model);
        Ok(Self {
            client: http_client(NAME, timeout)?,
            url,
            model: config.model.clone(),
            temperature,
            max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn describe(&self, image: &Path, prompt: &str) -> Result<String, BackendError> {
        let payload = GenerateRequest {
            model: &self.model,
            prompt,
            images: vec![image_to_base64(image)?],
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let body = post_json(NAME, self.client.post(&self.url).json(&payload))?;
        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|_| BackendError::InvalidResponse { backend: NAME, body })?;
        Ok(parsed.response.trim().to_string())
    }
}

/// Base URL with trailing slashes removed and `/api/generate` appended once.
fn generate_url(base: &str) -> String {
    let url = base.trim_end_matches('/');
    if url.ends_with(GENERATE_PATH) {
        url.to_string()
    } else {
        format!("{url}{GENERATE_PATH}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_server::serve_once;
    use tempfile::TempDir;

    fn backend(url: &str) -> OllamaBackend {
        let config = OllamaConfig {
            url: url.to_string(),
            model: "llava-llama3".to_string(),
        };
        OllamaBackend::new(&config, 0.2, 64, Duration::from_secs(5)).expect("backend")
    }

    fn image(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"jpegbytes").expect("write");
        path
    }

    #[test]
    fn endpoint_suffix_is_appended_exactly_once() {
        assert_eq!(generate_url("http://h:11434"), "http://h:11434/api/generate");
        assert_eq!(generate_url("http://h:11434/"), "http://h:11434/api/generate");
        assert_eq!(
            generate_url("http://h:11434/api/generate/"),
            "http://h:11434/api/generate"
        );
    }

    #[test]
    fn sends_generate_request_and_trims_response() {
        let dir = TempDir::new().expect("tempdir");
        let (url, captured) = serve_once(200, r#"{"response": "  A cat on a mat.\n"}"#);

        let text = backend(&url).describe(&image(&dir), "Describe.").expect("describe");
        assert_eq!(text, "A cat on a mat.");

        let request = captured.recv().expect("request");
        assert_eq!(request.request_line, "POST /api/generate HTTP/1.1");
        let payload: serde_json::Value = serde_json::from_str(&request.body).expect("json");
        assert_eq!(payload["model"], "llava-llama3");
        assert_eq!(payload["prompt"], "Describe.");
        assert_eq!(payload["stream"], false);
        assert_eq!(payload["images"][0], "anBlZ2J5dGVz");
        assert_eq!(payload["options"]["num_predict"], 64);
    }

    #[test]
    fn missing_response_field_is_empty_caption() {
        let dir = TempDir::new().expect("tempdir");
        let (url, _captured) = serve_once(200, r#"{"done": true}"#);
        assert_eq!(backend(&url).describe(&image(&dir), "p").expect("describe"), "");
    }

    #[test]
    fn error_status_carries_code_and_body() {
        let dir = TempDir::new().expect("tempdir");
        let (url, _captured) = serve_once(500, "model exploded");

        let err = backend(&url).describe(&image(&dir), "p").unwrap_err();
        match &err {
            BackendError::Status { status, body, .. } => {
                assert_eq!(*status, 500);
                assert_eq!(body, "model exploded");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.to_string(), "Ollama error 500: model exploded");
    }

    #[test]
    fn non_json_body_is_reported_verbatim() {
        let dir = TempDir::new().expect("tempdir");
        let (url, _captured) = serve_once(200, "<html>proxy</html>");

        let err = backend(&url).describe(&image(&dir), "p").unwrap_err();
        assert!(
            matches!(&err, BackendError::InvalidResponse { body, .. } if body == "<html>proxy</html>")
        );
    }

    #[test]
    fn connection_failure_is_a_transport_error() {
        let dir = TempDir::new().expect("tempdir");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = backend(&format!("http://{addr}"))
            .describe(&image(&dir), "p")
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport { .. }));
    }

    #[test]
    fn invalid_url_is_a_configuration_error() {
        let config = OllamaConfig {
            url: "not a url".to_string(),
            model: "m".to_string(),
        };
        assert!(matches!(
            OllamaBackend::new(&config, 0.2, 1, Duration::from_secs(1)),
            Err(AppError::InvalidConfig(_))
        ));
    }
}
