//! Configuration (spec §6 "Configuration (inputs)").
//!
//! Grounded on the teacher's `config::agent::AgentConfig` shape (nested,
//! serde-derived sections, TOML load/save, an `EnvConfig` overlay applied
//! after file load) rather than its v2 profile/provider system, since this
//! core has no multi-profile concept.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub agent: AgentSettings,
    pub tools: ToolsConfig,
    pub mongo: MongoConfig,
    pub system: SystemConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            agent: AgentSettings::default(),
            tools: ToolsConfig::default(),
            mongo: MongoConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from the default location (`<config_dir>/ema/config.toml`) or
    /// fall back to defaults, mirroring the teacher's `AgentConfig::load`.
    pub fn load() -> Self {
        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("ema").join("config.toml");
            if path.exists() {
                if let Ok(config) = Self::from_file(&path) {
                    return config;
                }
            }
        }
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatProvider {
    Openai,
    Google,
}

impl Default for ChatProvider {
    fn default() -> Self {
        ChatProvider::Openai
    }
}

/// Per-provider credentials and connection overrides (spec §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCreds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub chat_provider: ChatProvider,
    pub chat_model: String,
    pub openai: ProviderCreds,
    pub google: ProviderCreds,
    pub retry: RetryPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            chat_provider: ChatProvider::default(),
            chat_model: "gpt-4o-mini".to_string(),
            openai: ProviderCreds::default(),
            google: ProviderCreds::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub token_limit: usize,
    pub system_prompt_file: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self { max_steps: 25, token_limit: 128_000, system_prompt_file: PathBuf::from("system_prompt.md") }
    }
}

/// Gates which built-in tools are registered (spec §6 `tools.*: booleans`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolsConfig(pub HashMap<String, bool>);

impl ToolsConfig {
    pub fn is_enabled(&self, tool_name: &str) -> bool {
        self.0.get(tool_name).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MongoKind {
    Memory,
    Remote,
}

impl Default for MongoKind {
    fn default() -> Self {
        MongoKind::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub kind: MongoKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    pub db_name: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self { kind: MongoKind::default(), uri: None, db_name: "ema".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub data_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let data_root = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("ema");
        Self { data_root, http_proxy: None, https_proxy: None }
    }
}

/// Environment variable overlay, applied after file load (spec §6).
/// Mirrors the teacher's `EnvConfig::load` pattern: each recognized
/// variable overwrites one field when present, silently skipped
/// otherwise.
pub struct EnvConfig;

impl EnvConfig {
    /// Applies recognized environment overrides to `config` in place.
    pub fn apply(config: &mut Config) {
        if let Ok(provider) = env::var("EMA_CHAT_PROVIDER") {
            match provider.to_lowercase().as_str() {
                "openai" => config.llm.chat_provider = ChatProvider::Openai,
                "google" => config.llm.chat_provider = ChatProvider::Google,
                other => tracing::warn!(value = %other, "ignoring unrecognized EMA_CHAT_PROVIDER value"),
            }
        }
        if let Ok(model) = env::var("EMA_CHAT_MODEL") {
            config.llm.chat_model = model;
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            config.llm.openai.key = Some(key);
        }
        if let Ok(base) = env::var("OPENAI_API_BASE") {
            config.llm.openai.base_url = Some(base);
        }
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            config.llm.google.key = Some(key);
        }
        if let Ok(base) = env::var("GEMINI_API_BASE") {
            config.llm.google.base_url = Some(base);
        }

        // Upper-case wins over lower-case when both are set.
        let http_proxy = env::var("HTTP_PROXY").or_else(|_| env::var("http_proxy")).ok();
        if let Some(proxy) = http_proxy {
            config.system.http_proxy = Some(proxy);
        }
        let https_proxy = env::var("HTTPS_PROXY").or_else(|_| env::var("https_proxy")).ok();
        if let Some(proxy) = https_proxy {
            config.system.https_proxy = Some(proxy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.agent.max_steps, 25);
        assert_eq!(config.llm.chat_provider, ChatProvider::Openai);
        assert_eq!(config.mongo.kind, MongoKind::Memory);
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.llm.chat_model, config.llm.chat_model);
        assert_eq!(parsed.agent.token_limit, config.agent.token_limit);
    }

    #[test]
    fn env_overrides_apply_and_uppercase_proxy_wins() {
        // SAFETY: test runs single-threaded for env mutation via cargo's
        // default test harness isolation per-process; no other test in
        // this module touches these variables.
        env::set_var("EMA_CHAT_MODEL", "gpt-4o");
        env::set_var("HTTP_PROXY", "http://upper.example");
        env::set_var("http_proxy", "http://lower.example");

        let mut config = Config::default();
        EnvConfig::apply(&mut config);

        assert_eq!(config.llm.chat_model, "gpt-4o");
        assert_eq!(config.system.http_proxy.as_deref(), Some("http://upper.example"));

        env::remove_var("EMA_CHAT_MODEL");
        env::remove_var("HTTP_PROXY");
        env::remove_var("http_proxy");
    }

    #[test]
    fn tools_config_defaults_unknown_to_disabled() {
        let tools = ToolsConfig::default();
        assert!(!tools.is_enabled("web_search"));
    }
}
