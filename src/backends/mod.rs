pub mod llama_cpp;
pub mod ollama;
pub mod vllm;
