// Configuration module for the Vertigo proxy

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    pub gemini: GeminiConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_keys: Vec<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_quarantine_secs")]
    pub quarantine_secs: u64,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            quarantine_secs: default_quarantine_secs(),
        }
    }
}

impl GeminiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn quarantine(&self) -> Duration {
        Duration::from_secs(self.quarantine_secs)
    }
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_quarantine_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// History lives in process memory and is lost on restart
    Memory,
    /// History is persisted to SQLite
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_store_path")]
    pub path: String,

    /// Tee streamed deltas into the conversation history
    #[serde(default)]
    pub persist_streamed_turns: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            persist_streamed_turns: false,
        }
    }
}

fn default_store_path() -> String {
    "vertigo.db".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default = "default_fast")]
    pub fast: String,

    #[serde(default = "default_balanced")]
    pub balanced: String,

    #[serde(default = "default_best")]
    pub best: String,

    #[serde(default = "default_embedding")]
    pub embedding: String,

    /// Legacy completion model names mapped to upstream models
    #[serde(default = "default_legacy")]
    pub legacy: HashMap<String, String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            fast: default_fast(),
            balanced: default_balanced(),
            best: default_best(),
            embedding: default_embedding(),
            legacy: default_legacy(),
        }
    }
}

fn default_alias() -> String {
    "vertigo-1.0-blast".to_string()
}

fn default_fast() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_balanced() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_best() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_embedding() -> String {
    "text-embedding-004".to_string()
}

fn default_legacy() -> HashMap<String, String> {
    HashMap::from([
        ("text-davinci-003".to_string(), default_balanced()),
        ("gpt-3.5-turbo-instruct".to_string(), default_balanced()),
    ])
}

impl AppConfig {
    /// Read and validate the YAML document at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.gemini.api_keys.iter().all(|k| k.trim().is_empty()) {
            bail!("No API keys found in the configuration");
        }
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.trim().is_empty() {
            bail!("store.path is required for the sqlite backend");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        let host = if self.server.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.server.host
        };
        format!("{}:{}", host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = AppConfig::from_yaml("gemini:\n  api_keys: [\"k1\", \"k2\"]\n").unwrap();
        assert_eq!(config.gemini.api_keys, vec!["k1", "k2"]);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.gemini.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.models.alias, "vertigo-1.0-blast");
        assert_eq!(
            config.models.legacy.get("text-davinci-003").map(String::as_str),
            Some("gemini-2.5-flash")
        );
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9000
gemini:
  api_keys: [a]
  quarantine_secs: 30
store:
  backend: memory
  persist_streamed_turns: true
models:
  best: gemini-3-pro
debug: true
"#;
        let config = AppConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:9000");
        assert_eq!(config.gemini.quarantine(), Duration::from_secs(30));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.store.persist_streamed_turns);
        assert_eq!(config.models.best, "gemini-3-pro");
        assert_eq!(config.models.fast, "gemini-2.0-flash");
        assert!(config.debug);
    }

    #[test]
    fn test_missing_keys_rejected() {
        assert!(AppConfig::from_yaml("gemini:\n  api_keys: []\n").is_err());
        assert!(AppConfig::from_yaml("server:\n  port: 80\n").is_err());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load("/nonexistent/vertigo.yaml").is_err());
    }
}
