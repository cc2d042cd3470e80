use crate::backend::BackendKind;
use crate::storage::StorageMode;
use clap::Parser;
use std::path::PathBuf;

/// Describe images with a vision-language model and store the captions.
///
/// Flags left unset fall back to the config file, then built-in defaults.
#[derive(Parser, Debug)]
#[command(name = "describe-images", version)]
pub struct Cli {
    /// Path to an image or folder.
    pub path: PathBuf,

    /// Backend to use.
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    #[arg(long)]
    pub prompt: Option<String>,

    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[arg(long)]
    pub temperature: Option<f64>,

    /// Per-image request timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u32>,

    /// Where captions are persisted.
    #[arg(long, value_enum)]
    pub store: Option<StorageMode>,

    /// Path to JSON index file.
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Re-describe even if stored.
    #[arg(long)]
    pub force: bool,

    #[arg(long, overrides_with = "no_recursive")]
    recursive: bool,

    #[arg(long, overrides_with = "recursive")]
    no_recursive: bool,

    /// Configuration file (defaults to config/describe.* if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    #[arg(long, env = "OLLAMA_MODEL")]
    pub ollama_model: Option<String>,

    #[arg(long, env = "VLLM_URL")]
    pub vllm_url: Option<String>,

    #[arg(long, env = "VLLM_MODEL")]
    pub vllm_model: Option<String>,

    #[arg(long, env = "VLLM_API_KEY", hide_env_values = true)]
    pub vllm_api_key: Option<String>,

    #[arg(long, env = "LLAMA_BIN")]
    pub llama_bin: Option<PathBuf>,

    #[arg(long, env = "LLAMA_MODEL")]
    pub llama_model: Option<PathBuf>,

    #[arg(long, env = "LLAMA_MMPROJ")]
    pub llama_mmproj: Option<PathBuf>,

    /// Extra arguments for the llama.cpp binary, split like a shell would.
    #[arg(long, env = "LLAMA_EXTRA_ARGS", allow_hyphen_values = true)]
    pub llama_extra_args: Option<String>,
}

impl Cli {
    /// Explicit recursion choice, if one was given.
    pub fn recursive(&self) -> Option<bool> {
        if self.no_recursive {
            Some(false)
        } else if self.recursive {
            Some(true)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("describe-images").chain(args.iter().copied()))
            .expect("cli")
    }

    #[test]
    fn store_accepts_long_aliases() {
        assert_eq!(
            parse(&["x", "--store", "json-only"]).store,
            Some(StorageMode::Json)
        );
        assert_eq!(
            parse(&["x", "--store", "metadata-only"]).store,
            Some(StorageMode::Metadata)
        );
        assert_eq!(parse(&["x", "--store", "both"]).store, Some(StorageMode::Both));
    }

    #[test]
    fn backend_identifiers() {
        assert_eq!(
            parse(&["x", "--backend", "llama-cpp"]).backend,
            Some(BackendKind::LlamaCpp)
        );
        assert!(Cli::try_parse_from(["describe-images", "x", "--backend", "gpt"]).is_err());
    }

    #[test]
    fn last_recursion_flag_wins() {
        assert_eq!(parse(&["x"]).recursive(), None);
        assert_eq!(parse(&["x", "--no-recursive"]).recursive(), Some(false));
        assert_eq!(
            parse(&["x", "--no-recursive", "--recursive"]).recursive(),
            Some(true)
        );
    }
}
