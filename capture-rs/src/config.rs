use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Ten years
const MAX_RETENTION_MINUTES: u64 = 10 * 365 * 24 * 60;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub aliases: AliasConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Name announced in greetings and stamped into Received headers
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub listen_addr: String,
    /// Primary domain, always accepted
    pub domain: String,
    /// Mail for this domain is acknowledged but never persisted
    pub domain_no_store: String,
    /// Extra accepted domains; empty accepts every recipient domain
    #[serde(default)]
    pub accepted_domains: Vec<String>,
    pub max_recipients: usize,
    pub max_idle_seconds: u64,
    pub max_message_bytes: usize,
    pub store_messages: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: String,
    /// Zero disables the retention scanner
    pub retention_minutes: u64,
    /// Pause between mailboxes during a retention pass
    pub retention_sleep_millis: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AliasConfig {
    pub database_url: Option<String>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl SmtpConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_seconds)
    }

    /// Whether a recipient domain may be accepted at all
    pub fn accepts_domain(&self, domain: &str) -> bool {
        if self.accepted_domains.is_empty()
            || self.is_no_store(domain)
            || self.domain.eq_ignore_ascii_case(domain)
        {
            return true;
        }
        self.accepted_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub fn is_no_store(&self, domain: &str) -> bool {
        !self.domain_no_store.is_empty() && self.domain_no_store.eq_ignore_ascii_case(domain)
    }
}

impl StorageConfig {
    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_minutes.saturating_mul(60))
    }

    pub fn retention_sleep(&self) -> Duration {
        Duration::from_millis(self.retention_sleep_millis)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailError::Config(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| MailError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.smtp.max_recipients == 0 {
            return Err(MailError::Config("max_recipients must be positive".to_string()));
        }
        if self.smtp.max_message_bytes == 0 {
            return Err(MailError::Config(
                "max_message_bytes must be positive".to_string(),
            ));
        }
        if self.smtp.max_idle_seconds == 0 {
            return Err(MailError::Config(
                "max_idle_seconds must be positive".to_string(),
            ));
        }
        if self.storage.retention_minutes > MAX_RETENTION_MINUTES {
            return Err(MailError::Config(format!(
                "retention_minutes must not exceed {}",
                MAX_RETENTION_MINUTES
            )));
        }
        Ok(())
    }

    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                hostname: "inbucket.local".to_string(),
            },
            smtp: SmtpConfig {
                listen_addr: "0.0.0.0:2500".to_string(),
                domain: "inbucket.local".to_string(),
                domain_no_store: "bitbucket.local".to_string(),
                accepted_domains: Vec::new(),
                max_recipients: 100,
                max_idle_seconds: 300,
                max_message_bytes: 2_048_000,
                store_messages: true,
            },
            storage: StorageConfig {
                backend: StorageBackend::File,
                path: "/tmp/capture".to_string(),
                retention_minutes: 240,
                retention_sleep_millis: 100,
            },
            aliases: AliasConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.retention_window(), Duration::from_secs(240 * 60));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
hostname = "mx.test"

[smtp]
listen_addr = "127.0.0.1:2525"
domain = "capture.test"
domain_no_store = "void.test"
max_recipients = 5
max_idle_seconds = 5
max_message_bytes = 5000
store_messages = true

[storage]
backend = "memory"
path = ""
retention_minutes = 0
retention_sleep_millis = 0

[[aliases.groups]]
name = "team"
members = ["a@capture.test", "b@capture.test"]

[logging]
level = "debug"
format = "json"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.smtp.max_recipients, 5);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.aliases.groups[0].members.len(), 2);
        assert!(config.aliases.database_url.is_none());
        assert!(config.smtp.accepted_domains.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.smtp.max_recipients = 0;
        assert!(matches!(config.validate(), Err(MailError::Config(_))));
    }

    #[test]
    fn test_validate_bounds_retention() {
        let mut config = Config::default();
        config.storage.retention_minutes = MAX_RETENTION_MINUTES;
        assert!(config.validate().is_ok());

        config.storage.retention_minutes = u64::MAX;
        assert!(matches!(config.validate(), Err(MailError::Config(_))));
        assert_eq!(
            config.storage.retention_window(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_accepts_domain() {
        let mut smtp = Config::default().smtp;
        assert!(smtp.accepts_domain("anything.example"));

        smtp.accepted_domains = vec!["capture.test".to_string()];
        assert!(smtp.accepts_domain("CAPTURE.test"));
        assert!(smtp.accepts_domain("bitbucket.local"));
        assert!(smtp.accepts_domain("Inbucket.Local"));
        assert!(!smtp.accepts_domain("elsewhere.example"));
    }
}
