use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkeinError};

/// Top-level skein configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    /// Named model configurations, selected by session `model_type`.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request deadline in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }
fn default_timeout_secs() -> u64 { 120 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Embedding model configuration for the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "ollama" or "openai" (any OpenAI-compatible API).
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: default_embedding_base_url(),
            api_key: None,
            timeout_secs: default_embedding_timeout(),
        }
    }
}

fn default_embedding_provider() -> String { "ollama".to_string() }
fn default_embedding_model() -> String { "nomic-embed-text".to_string() }
fn default_embedding_base_url() -> String { "http://localhost:11434".to_string() }
fn default_embedding_timeout() -> u64 { 30 }

/// Vector store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path. `~/` is expanded.
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            index_name: default_index_name(),
            key_prefix: default_key_prefix(),
            default_k: default_k(),
        }
    }
}

fn default_store_path() -> String { "~/.skein/vectors.db".to_string() }
fn default_index_name() -> String { "idx:rag_data".to_string() }
fn default_key_prefix() -> String { "rag:data:".to_string() }
fn default_k() -> usize { 5 }

/// Travel-planning pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory the prompt file names below are resolved against.
    #[serde(default = "default_prompt_dir")]
    pub prompt_dir: String,
    #[serde(default = "default_classify_prompt")]
    pub classify_prompt: String,
    #[serde(default = "default_blocked_notice")]
    pub blocked_notice: String,
    #[serde(default = "default_allowed_notice")]
    pub allowed_notice: String,
    #[serde(default = "default_summary_prompt")]
    pub summary_prompt: String,
    /// Iteration ceiling handed to every specialist agent.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Route an unparseable classifier reply to the blocked branch instead
    /// of treating it as "no flag raised".
    #[serde(default)]
    pub block_on_unparsed_judgment: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prompt_dir: default_prompt_dir(),
            classify_prompt: default_classify_prompt(),
            blocked_notice: default_blocked_notice(),
            allowed_notice: default_allowed_notice(),
            summary_prompt: default_summary_prompt(),
            max_iterations: default_max_iterations(),
            block_on_unparsed_judgment: false,
        }
    }
}

impl PipelineConfig {
    /// Resolve a prompt file name against `prompt_dir`.
    pub fn prompt_path(&self, name: &str) -> PathBuf {
        expand_home(&self.prompt_dir).join(name)
    }
}

fn default_prompt_dir() -> String { "prompts".to_string() }
fn default_classify_prompt() -> String { "red_flag_system.txt".to_string() }
fn default_blocked_notice() -> String { "red_flag_notice.txt".to_string() }
fn default_allowed_notice() -> String { "no_red_flag_notice.txt".to_string() }
fn default_summary_prompt() -> String { "summary_prompt.txt".to_string() }
fn default_max_iterations() -> usize { 50 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SkeinError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| SkeinError::Config(e.to_string()))
    }

    /// Model configuration for a session `model_type`.
    ///
    /// An empty type, or the provider name of the default model, selects `[model]`.
    pub fn model_for(&self, model_type: &str) -> Option<&ModelConfig> {
        if model_type.is_empty() || model_type == self.model.provider {
            return Some(&self.model);
        }
        self.models.get(model_type)
    }

    /// Resolved vector database path.
    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
