use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypostError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Accessibility error: {0}")]
    Accessibility(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type WaypostResult<T> = Result<T, WaypostError>;
