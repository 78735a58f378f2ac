use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::request::RequestSettings;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_output_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_system_prompt() -> String {
    "You are Dalma, the assistant of the Dalma community platform. \
     Help users in a professional, friendly way: answer questions clearly and \
     accurately, describe any attached images, and keep suggestions practical."
        .to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Usually supplied through the environment rather than the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            prompt_id: None,
            prompt_version: None,
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub enable_fallback: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            system_prompt: default_system_prompt(),
            enable_fallback: false,
        }
    }
}

impl Config {
    /// File first, then environment overrides. A missing or broken file is
    /// a logged warning, never a startup failure.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => config,
                    Err(err) => {
                        tracing::warn!(error = %err, "could not parse config.toml, using defaults");
                        Config::default()
                    }
                },
                Err(err) => {
                    tracing::warn!(error = %err, "could not read config.toml, using defaults");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(host) = env::var("DALMA_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(port = %port, "ignoring unparseable PORT"),
            }
        }
        if let Ok(url) = env::var("DALMA_API_URL") {
            self.upstream.api_url = url;
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Ok(model) = env::var("MODEL") {
            self.upstream.model = model;
        }
        if let Ok(id) = env::var("DALMA_PROMPT_ID") {
            self.upstream.prompt_id = Some(id);
        }
        if let Ok(version) = env::var("DALMA_PROMPT_VERSION") {
            self.upstream.prompt_version = Some(version);
        }
        if let Ok(value) = env::var("ENABLE_FALLBACK") {
            self.chat.enable_fallback = matches!(value.as_str(), "1" | "true" | "yes");
        }
    }

    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings {
            model: self.upstream.model.clone(),
            system_prompt: self.chat.system_prompt.clone(),
            prompt_id: self.upstream.prompt_id.clone(),
            prompt_version: self.upstream.prompt_version.clone(),
            max_tokens: self.upstream.max_output_tokens,
            temperature: self.upstream.temperature,
        }
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/dalma-relay")
        } else {
            PathBuf::from(".")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.upstream.model, "gpt-4o-mini");
        assert_eq!(config.upstream.max_retries, 3);
        assert_eq!(config.upstream.retry_base_delay_ms, 1000);
        assert!(!config.chat.enable_fallback);
        assert!(config.upstream.api_key.is_none());
    }

    #[test]
    fn partial_sections_keep_unlisted_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            model = "gpt-4o"
            max_retries = 5

            [chat]
            enable_fallback = true
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.model, "gpt-4o");
        assert_eq!(config.upstream.max_retries, 5);
        assert_eq!(config.upstream.max_output_tokens, 1000);
        assert!(config.chat.enable_fallback);
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn request_settings_carry_the_prompt_reference() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            prompt_id = "pmpt_9"
            prompt_version = "2"
            "#,
        )
        .unwrap();

        let settings = config.request_settings();
        assert_eq!(settings.prompt_id.as_deref(), Some("pmpt_9"));
        assert_eq!(settings.prompt_version.as_deref(), Some("2"));
    }
}
