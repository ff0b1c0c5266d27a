//! Configuration types for the moxy proxy.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::rules::RuleSpec;

/// Listener protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// TLS configuration for the HTTPS listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to TLS certificate file (PEM format)
    pub cert_path: String,
    /// Path to TLS private key file (PEM format)
    pub key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Protocol for listener (http or https)
    #[serde(default)]
    pub protocol: Protocol,
    /// TLS configuration (required when protocol is https)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Control-plane listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
}

fn default_control_port() -> u16 {
    45456
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_control_port(),
        }
    }
}

/// Response returned when no rule matches a request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmatchedConfig {
    #[serde(default = "default_unmatched_status")]
    pub status: u16,
    #[serde(default = "default_unmatched_body")]
    pub body: String,
}

fn default_unmatched_status() -> u16 {
    503
}

fn default_unmatched_body() -> String {
    "No rules were found matching this request".to_string()
}

impl Default for UnmatchedConfig {
    fn default() -> Self {
        Self {
            status: default_unmatched_status(),
            body: default_unmatched_body(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub unmatched: UnmatchedConfig,
    /// Upper bound, in seconds, on how long a timeout handler may hold a
    /// connection. Unset means hold until the client gives up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hold_ceiling_secs: Option<u64>,
    /// Rules loaded at startup, evaluated in order.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.listen.protocol == Protocol::Https && self.listen.tls.is_none() {
            anyhow::bail!(
                "TLS configuration is required when listener protocol is 'https'. \
                 Please provide 'listen.tls.cert_path' and 'listen.tls.key_path'"
            );
        }
        if self.timeout_hold_ceiling_secs == Some(0) {
            anyhow::bail!("'timeout_hold_ceiling_secs' must be greater than zero when set");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig {
                host: default_host(),
                port: 8000,
                protocol: Protocol::Http,
                tls: None,
            },
            control: ControlConfig::default(),
            unmatched: UnmatchedConfig::default(),
            timeout_hold_ceiling_secs: None,
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
listen:
  port: 8000
control:
  port: 45456
rules:
  - id: "hello"
    predicates:
      - match: method
        value: GET
      - match: path
        value: "/hello"
    action: reply
    status: 200
    body: "Hello!"
  - id: "drop-it"
    predicates:
      - match: path
        value: "/drop"
    action: closeConnection
    repeat:
      times: 2
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listen.port, 8000);
        assert_eq!(config.listen.protocol, Protocol::Http);
        assert_eq!(config.control.port, 45456);
        assert_eq!(config.unmatched.status, 503);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].id.as_deref(), Some("hello"));
        assert_eq!(config.rules[1].id.as_deref(), Some("drop-it"));
        config.validate().unwrap();
    }

    #[test]
    fn test_https_requires_tls() {
        let yaml = r#"
listen:
  port: 8443
  protocol: https
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_https_with_tls_paths() {
        let yaml = r#"
listen:
  port: 8443
  protocol: https
  tls:
    cert_path: "certs/server.pem"
    key_path: "certs/server-key.pem"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.listen.tls.unwrap().cert_path, "certs/server.pem");
    }

    #[test]
    fn test_load_from_file() {
        let yaml = r#"
listen:
  port: 9090
unmatched:
  status: 404
  body: "nothing here"
timeout_hold_ceiling_secs: 30
rules:
  - id: "ping"
    predicates:
      - match: path
        value: "/ping"
    action: reply
    status: 200
    body: "pong"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moxy.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.listen.port, 9090);
        assert_eq!(config.unmatched.status, 404);
        assert_eq!(config.unmatched.body, "nothing here");
        assert_eq!(config.timeout_hold_ceiling_secs, Some(30));
        assert_eq!(config.rules.len(), 1);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("moxy.yaml");
        std::fs::write(&path, "listen:\n  protocol: https\n  port: 8443\n").unwrap();
        assert!(Config::from_file(&path).is_err());

        assert!(Config::from_file(dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.unmatched.status, 503);
        assert!(config.timeout_hold_ceiling_secs.is_none());
        assert!(config.rules.is_empty());
    }
}
