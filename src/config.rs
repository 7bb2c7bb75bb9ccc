use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub twilio: TwilioConfig,
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub proxy_service_sid: String,
    #[serde(default = "default_flex_base_url")]
    pub flex_base_url: String,
    #[serde(default = "default_proxy_base_url")]
    pub proxy_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Route the bridge function is served on.
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_flex_base_url() -> String {
    "https://flex-api.twilio.com/v1".to_string()
}

fn default_proxy_base_url() -> String {
    "https://proxy.twilio.com/v1".to_string()
}

fn default_bind_address() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_path() -> String {
    "/create-direct-to-task-sms-chat".to_string()
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind_address: default_bind_address(),
        path: default_path(),
    }
}

fn default_twilio_config() -> TwilioConfig {
    TwilioConfig {
        account_sid: String::new(),
        auth_token: String::new(),
        proxy_service_sid: String::new(),
        flex_base_url: default_flex_base_url(),
        proxy_base_url: default_proxy_base_url(),
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    /// A missing file is not an error: credentials may come from the
    /// environment alone.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    fn load_with_env(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)?
        } else {
            Config {
                twilio: default_twilio_config(),
                server: default_server_config(),
            }
        };

        config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Override credentials with the variables the serverless context exposes.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides = [
            ("ACCOUNT_SID", &mut self.twilio.account_sid),
            ("AUTH_TOKEN", &mut self.twilio.auth_token),
            ("TWILIO_PROXY_SERVICE_SID", &mut self.twilio.proxy_service_sid),
        ];
        for (key, slot) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *slot = value;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("twilio.account_sid", &self.twilio.account_sid),
            ("twilio.auth_token", &self.twilio.auth_token),
            ("twilio.proxy_service_sid", &self.twilio.proxy_service_sid),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("Missing required configuration value: {}", key);
            }
        }
        Ok(())
    }
}
