//! Server configuration, read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;

use crate::chat::turn::{DEFAULT_SYSTEM_PROMPT, TurnSettings};
use crate::error::ConfigError;
use crate::llm::LlmConfig;

/// Everything needed to start the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// SQLite database file.
    pub db_path: PathBuf,
    pub llm: LlmConfig,
    /// Prior messages the classifier sees.
    pub classify_context: usize,
    pub turn: TurnSettings,
}

impl ServerConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset and blank values take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = get("AI_PROVIDER").unwrap_or_else(|| "ollama".to_string());
        let base_url = get("AI_BASE_URL").unwrap_or_else(|| "http://localhost:11434".to_string());
        let model = get("AI_MODEL").unwrap_or_else(|| "llama3.2".to_string());
        let mut llm = LlmConfig::new(&provider, &base_url, model);
        if let Some(key) = get("AI_API_KEY") {
            llm = llm.with_api_key(SecretString::from(key));
        }

        let turn = TurnSettings {
            system_prompt: get("CLAWCHAT_SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            history_window: parse(&get, "CLAWCHAT_HISTORY_WINDOW", 20)?,
            classify_first: parse_bool(&get, "CLAWCHAT_CLASSIFY_FIRST", true)?,
        };
        if turn.history_window == 0 {
            return Err(invalid("CLAWCHAT_HISTORY_WINDOW", "must be at least 1"));
        }

        Ok(Self {
            host: get("CLAWCHAT_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse(&get, "CLAWCHAT_PORT", 8000)?,
            db_path: get("CLAWCHAT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/clawchat.db")),
            llm,
            classify_context: parse(&get, "CLAWCHAT_CLASSIFY_CONTEXT", 6)?,
            turn,
        })
    }

    /// Socket address to bind.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| invalid("CLAWCHAT_HOST", format!("{e}")))
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| invalid(key, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, format!("{raw:?} is not a boolean"))),
    }
}
