use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_MESSAGE_SIZE;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    pub log_level: Option<String>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub max_message_size: Option<usize>,
    #[serde(default)]
    pub connection_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_absolute_timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_sweep_interval_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Default to Mongo's standard port locally
            listen_addr: "127.0.0.1:27017".to_string(),
            log_level: None,
            max_connections: None,
            max_message_size: None,
            connection_idle_timeout_secs: None,
            session_idle_timeout_secs: None,
            session_absolute_timeout_secs: None,
            session_sweep_interval_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. If `path_opt` is None or the file
    /// is missing/unreadable, returns defaults. Parsing errors are returned.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let path = path_opt.unwrap_or("config.toml");
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(cfg) => Ok(cfg),
                Err(e) => Err(Error::Msg(format!("Failed to parse {}: {}", path, e))),
            },
            Err(_e) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    pub fn with_overrides(
        mut self,
        listen_addr: Option<String>,
        log_level: Option<String>,
        max_connections: Option<usize>,
    ) -> Self {
        if let Some(addr) = listen_addr {
            self.listen_addr = addr;
        }
        if let Some(ll) = log_level {
            self.log_level = Some(ll);
        }
        if let Some(mc) = max_connections {
            self.max_connections = Some(mc);
        }
        self
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(512)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_secs.unwrap_or(5 * 60))
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs.unwrap_or(10 * 60))
    }

    pub fn session_absolute_timeout(&self) -> Duration {
        Duration::from_secs(self.session_absolute_timeout_secs.unwrap_or(30 * 60))
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs.unwrap_or(60))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::Msg("listen_addr cannot be empty".to_string()));
        }
        if !self.listen_addr.contains(':') {
            return Err(Error::Msg(format!(
                "listen_addr '{}' must be in host:port format",
                self.listen_addr
            )));
        }
        if self.max_connections() == 0 {
            return Err(Error::Msg("max_connections must be positive".to_string()));
        }
        if self.max_message_size() < crate::protocol::HEADER_LEN {
            return Err(Error::Msg(format!(
                "max_message_size {} is smaller than a message header",
                self.max_message_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.listen_addr, "127.0.0.1:27017");
        assert_eq!(cfg.max_message_size(), 48_000_000);
        assert_eq!(cfg.connection_idle_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.session_idle_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.session_absolute_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn overrides_take_precedence() {
        let cfg = Config::default().with_overrides(
            Some("0.0.0.0:27018".into()),
            Some("debug".into()),
            Some(5),
        );
        assert_eq!(cfg.listen_addr, "0.0.0.0:27018");
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.max_connections(), 5);
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let mut cfg = Config::default();
        cfg.listen_addr = "nonsense".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_parsing() {
        let parsed: Config = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:0"
            max_connections = 7
            session_idle_timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(parsed.max_connections(), 7);
        assert_eq!(parsed.session_idle_timeout(), Duration::from_secs(60));
    }
}
