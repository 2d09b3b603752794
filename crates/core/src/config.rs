use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub limits: LimitsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            storage: StorageConfig::from_env(),
            auth: AuthConfig::from_env(),
            llm: LlmConfig::from_env(),
            limits: LimitsConfig::from_env(),
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  server:   {}:{}", self.server.host, self.server.port);
        tracing::info!("  storage:  data_dir={}", self.storage.data_dir.display());
        tracing::info!(
            "  auth:     token_ttl_days={}, secret={}",
            self.auth.token_ttl_days,
            if self.auth.secret_key == AuthConfig::DEFAULT_SECRET {
                "(default — change in production)"
            } else {
                "(set)"
            }
        );
        tracing::info!(
            "  llm:      model={}, api_key={}",
            self.llm.model,
            if self.llm.api_key.is_some() { "(set)" } else { "(missing)" }
        );
        tracing::info!(
            "  limits:   max_iterations={}, max_turn_seconds={}, max_result_rows={}",
            self.limits.max_iterations,
            self.limits.max_turn_seconds,
            self.limits.max_result_rows
        );
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_u16("PORT", 3001),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Upload cap in bytes. Enforced by the upload collaborator; kept here so
    /// both sides validate against the same number.
    pub max_upload_bytes: u64,
}

impl StorageConfig {
    fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(env_or("DATA_DIR", "data")),
            max_upload_bytes: env_u64("MAX_UPLOAD_SIZE", 1_073_741_824),
        }
    }
}

// ── Auth (token consumption only — issuance lives elsewhere) ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub secret_key: String,
    pub token_ttl_days: u32,
}

impl AuthConfig {
    const DEFAULT_SECRET: &'static str = "change-me-in-production";

    fn from_env() -> Self {
        Self {
            secret_key: env_or("SECRET_KEY", Self::DEFAULT_SECRET),
            token_ttl_days: env_u32("TOKEN_TTL_DAYS", 30),
        }
    }
}

// ── LLM ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmConfig {
    fn from_env() -> Self {
        Self {
            api_key: env_opt("ANTHROPIC_API_KEY"),
            model: env_or("ANTHROPIC_MODEL", "claude-sonnet-4-5-20250929"),
            base_url: env_or("ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
            max_tokens: env_u32("LLM_MAX_TOKENS", 4096),
            temperature: env_f32("LLM_TEMPERATURE", 0.1),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

// ── Agent limits ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound on LLM round-trips per turn.
    pub max_iterations: usize,
    /// Whole-turn wall clock in seconds.
    pub max_turn_seconds: u64,
    /// Row cap for sql_query tool results.
    pub max_result_rows: usize,
    /// Row cap for plot source data.
    pub max_plot_rows: usize,
    /// Per-attempt LLM request timeout in seconds.
    pub llm_timeout_seconds: u64,
    /// SQL execution deadline in seconds.
    pub sql_timeout_seconds: u64,
    /// Approximate token budget for replayed conversation context.
    pub context_token_budget: usize,
    /// Rows cached in the dataset preview at upload.
    pub preview_rows: usize,
}

impl LimitsConfig {
    fn from_env() -> Self {
        Self {
            max_iterations: env_usize("MAX_ITERATIONS", 15),
            max_turn_seconds: env_u64("MAX_TURN_SECONDS", 600),
            max_result_rows: env_usize("MAX_RESULT_ROWS", 50),
            max_plot_rows: env_usize("MAX_PLOT_ROWS", 100),
            llm_timeout_seconds: env_u64("LLM_TIMEOUT_SECONDS", 60),
            sql_timeout_seconds: env_u64("SQL_TIMEOUT_SECONDS", 10),
            context_token_budget: env_usize("CONTEXT_TOKEN_BUDGET", 32_000),
            preview_rows: env_usize("PREVIEW_ROWS", 500),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        // Env-free construction for tests and embedded use.
        Self {
            max_iterations: 15,
            max_turn_seconds: 600,
            max_result_rows: 50,
            max_plot_rows: 100,
            llm_timeout_seconds: 60,
            sql_timeout_seconds: 10,
            context_token_budget: 32_000,
            preview_rows: 500,
        }
    }
}
