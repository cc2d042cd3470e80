use crate::backend::BackendKind;
use crate::cli::Cli;
use crate::storage::StorageMode;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::PathBuf;

pub const DEFAULT_PROMPT: &str = "Describe this image in maximum detail. Include objects, people, \
actions, setting, architecture/interior style, materials, lighting, time of day, weather, text, \
and notable attributes. Also infer the most likely scene category and setting type \
(e.g. house/flat/shop/office/warehouse/construction site/restaurant, and if shop, the \
type of shop). Provide any plausible alternatives if uncertain. Be specific.";

const DEFAULT_CONFIG_FILE: &str = "config/describe";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    pub store: StorageMode,
    pub index: Option<PathBuf>,
    pub force: bool,
    pub recursive: bool,
    pub log_level: String,
    pub ollama: OllamaConfig,
    pub vllm: VllmConfig,
    #[serde(default)]
    pub llama_cpp: LlamaCppConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VllmConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LlamaCppConfig {
    pub bin: Option<PathBuf>,
    pub model: Option<PathBuf>,
    pub mmproj: Option<PathBuf>,
    pub extra_args: Option<String>,
}

impl AppConfig {
    /// Merges built-in defaults, an optional config file, and the command
    /// line (which already folds in the backend environment variables).
    pub fn new(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => File::from(path.as_path()).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let s = Config::builder()
            .set_default("backend", BackendKind::Ollama.as_str())?
            .set_default("prompt", DEFAULT_PROMPT)?
            .set_default("max_tokens", 1024)?
            .set_default("temperature", 0.2)?
            .set_default("timeout", 120)?
            .set_default("store", StorageMode::Auto.as_str())?
            .set_default("force", false)?
            .set_default("recursive", true)?
            .set_default("log_level", "info")?
            .set_default("ollama.url", "http://localhost:11434")?
            .set_default("ollama.model", "llava-llama3")?
            .set_default("vllm.url", "http://localhost:8000/v1/chat/completions")?
            .set_default("vllm.model", "llava-llama3")?
            .add_source(file)
            .set_override_option("backend", cli.backend.map(BackendKind::as_str))?
            .set_override_option("prompt", cli.prompt.clone())?
            .set_override_option("max_tokens", cli.max_tokens.map(i64::from))?
            .set_override_option("temperature", cli.temperature)?
            .set_override_option("timeout", cli.timeout.map(i64::from))?
            .set_override_option("store", cli.store.map(StorageMode::as_str))?
            .set_override_option("index", path_value(&cli.index))?
            .set_override_option("force", cli.force.then_some(true))?
            .set_override_option("recursive", cli.recursive())?
            .set_override_option("log_level", cli.log_level.clone())?
            .set_override_option("ollama.url", cli.ollama_url.clone())?
            .set_override_option("ollama.model", cli.ollama_model.clone())?
            .set_override_option("vllm.url", cli.vllm_url.clone())?
            .set_override_option("vllm.model", cli.vllm_model.clone())?
            .set_override_option("vllm.api_key", cli.vllm_api_key.clone())?
            .set_override_option("llama_cpp.bin", path_value(&cli.llama_bin))?
            .set_override_option("llama_cpp.model", path_value(&cli.llama_model))?
            .set_override_option("llama_cpp.mmproj", path_value(&cli.llama_mmproj))?
            .set_override_option("llama_cpp.extra_args", cli.llama_extra_args.clone())?
            .build()?;

        s.try_deserialize()
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

fn path_value(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}
