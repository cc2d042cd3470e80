use crate::backends::{llama_cpp::LlamaCppBackend, ollama::OllamaBackend, vllm::VllmBackend};
use crate::config::AppConfig;
use crate::error::{AppError, BackendError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Identifier of a captioning engine, as written into description records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Ollama,
    Vllm,
    LlamaCpp,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Ollama => "ollama",
            BackendKind::Vllm => "vllm",
            BackendKind::LlamaCpp => "llama-cpp",
        }
    }
}

/// Something that turns an image into a caption.
pub trait Describer {
    fn describe(&self, image: &Path, prompt: &str) -> Result<String, BackendError>;

    fn kind(&self) -> BackendKind;

    /// Model name or path reported in description records.
    fn model_name(&self) -> Option<&str>;
}

/// The backend selected for a run.
pub enum Backend {
    Ollama(OllamaBackend),
    Vllm(VllmBackend),
    LlamaCpp(LlamaCppBackend),
}

impl Backend {
    /// Builds the configured backend, validating its parameters up front.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let timeout = Duration::from_secs(config.timeout);
        log::debug!("Selecting backend {}", config.backend.as_str());

        let backend = match config.backend {
            BackendKind::Ollama => Backend::Ollama(OllamaBackend::new(
                &config.ollama,
                config.temperature,
                config.max_tokens,
                timeout,
            )?),
            BackendKind::Vllm => Backend::Vllm(VllmBackend::new(
                &config.vllm,
                config.temperature,
                config.max_tokens,
                timeout,
            )?),
            BackendKind::LlamaCpp => Backend::LlamaCpp(LlamaCppBackend::new(
                &config.llama_cpp,
                config.max_tokens,
                timeout,
            )?),
        };
        Ok(backend)
    }
}

impl Describer for Backend {
    fn describe(&self, image: &Path, prompt: &str) -> Result<String, BackendError> {
        match self {
            Backend::Ollama(b) => b.describe(image, prompt),
            Backend::Vllm(b) => b.describe(image, prompt),
            Backend::LlamaCpp(b) => b.describe(image, prompt),
        }
    }

    fn kind(&self) -> BackendKind {
        match self {
            Backend::Ollama(_) => BackendKind::Ollama,
            Backend::Vllm(_) => BackendKind::Vllm,
            Backend::LlamaCpp(_) => BackendKind::LlamaCpp,
        }
    }

    fn model_name(&self) -> Option<&str> {
        match self {
            Backend::Ollama(b) => Some(b.model()),
            Backend::Vllm(b) => Some(b.model()),
            Backend::LlamaCpp(b) => b.model_path().to_str(),
        }
    }
}

pub(crate) fn image_to_base64(path: &Path) -> Result<String, BackendError> {
    let bytes = fs::read(path).map_err(|source| BackendError::ReadImage {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub(crate) fn image_to_data_url(path: &Path) -> Result<String, BackendError> {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Ok(format!("data:{};base64,{}", mime, image_to_base64(path)?))
}

pub(crate) fn http_client(
    backend: &'static str,
    timeout: Duration,
) -> Result<reqwest::blocking::Client, AppError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::InvalidConfig(format!("{backend}: cannot build HTTP client: {e}")))
}

pub(crate) fn parse_url(backend: &'static str, raw: &str) -> Result<url::Url, AppError> {
    url::Url::parse(raw)
        .map_err(|e| AppError::InvalidConfig(format!("{backend}: invalid URL {raw:?}: {e}")))
}

/// Sends a JSON request and returns the raw body of a successful response.
pub(crate) fn post_json(
    backend: &'static str,
    request: reqwest::blocking::RequestBuilder,
) -> Result<String, BackendError> {
    let response = request
        .send()
        .map_err(|source| BackendError::Transport { backend, source })?;
    let status = response.status();
    let body = response
        .text()
        .map_err(|source| BackendError::Transport { backend, source })?;
    if status.is_client_error() || status.is_server_error() {
        return Err(BackendError::Status {
            backend,
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Loopback HTTP server answering each connection with a canned response.

    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    pub struct Captured {
        pub request_line: String,
        pub headers: Vec<String>,
        pub body: String,
    }

    /// Serves one request and returns the base URL plus a receiver for the
    /// captured request.
    pub fn serve_once(status: u16, body: &str) -> (String, mpsc::Receiver<Captured>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let body = body.to_string();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));

            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("request line");
            let mut headers = Vec::new();
            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header");
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().expect("length");
                    }
                }
                headers.push(line);
            }
            let mut request_body = vec![0; content_length];
            reader.read_exact(&mut request_body).expect("body");

            let mut stream = stream;
            let response = format!(
                "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).expect("write");
            let _ = tx.send(Captured {
                request_line: request_line.trim_end().to_string(),
                headers,
                body: String::from_utf8_lossy(&request_body).into_owned(),
            });
        });

        (format!("http://{}", addr), rx)
    }
}
