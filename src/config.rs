use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";

/// Settings for the remote chat completion endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub http_referer: String,
    pub app_title: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            http_referer: "http://localhost:5000".to_string(),
            app_title: "Asistente de PDF".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide configuration, built once at startup and shared through `AppState`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub llm: LlmConfig,
}

impl Config {
    /// Config rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            data_dir: data_dir.into(),
            max_upload_bytes: 50 * 1024 * 1024,
            llm: LlmConfig::default(),
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::with_data_dir(env_or("DATA_DIR", "data"));

        if let Some(addr) = env_opt("BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|e| AppError::Config(format!("BIND_ADDR '{}': {}", addr, e)))?;
        }
        if let Some(bytes) = env_opt("MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse_number("MAX_UPLOAD_BYTES", &bytes)?;
        }
        if let Some(secs) = env_opt("REQUEST_TIMEOUT_SECS") {
            config.llm.timeout = Duration::from_secs(parse_number("REQUEST_TIMEOUT_SECS", &secs)?);
        }

        config.llm.api_key = env_or("OPENROUTER_API_KEY", "");
        config.llm.base_url = env_or("API_BASE_URL", DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        config.llm.model = env_or("MODEL_NAME", DEFAULT_MODEL);
        config.llm.http_referer = env_or("OPENROUTER_HTTP_REFERER", &config.llm.http_referer);
        config.llm.app_title = env_or("OPENROUTER_TITLE", &config.llm.app_title);

        if config.llm.api_key.is_empty() {
            tracing::warn!("OPENROUTER_API_KEY is not set; completion requests will be unauthenticated");
        }

        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("database.sqlite")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Directory holding the extracted images of one document.
    pub fn document_images_dir(&self, document_id: &str) -> PathBuf {
        self.images_dir().join(document_id)
    }

    /// Create the data, uploads and images directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [self.data_dir.clone(), self.uploads_dir(), self.images_dir()] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{} '{}': {}", key, value, e)))
}
