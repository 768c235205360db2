//! Kafka client configuration.
//!
//! Translates the YAML broker section into the key/value settings expected
//! by `rdkafka::ClientConfig`, with support for SASL and TLS.
//!
//! # Example
//!
//! ```rust
//! use cdc_interceptor::broker::config::KafkaClientConfig;
//!
//! let config = KafkaClientConfig::new("localhost:9092")
//!     .with_sasl_scram_sha256("user", "secret");
//! let settings = config.consumer_settings("interceptor-orders");
//! assert!(settings.iter().any(|(k, v)| k == "group.id" && v == "interceptor-orders"));
//! ```

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::{BrokerSettings, KafkaSecurityConfig};

/// Errors that can occur while building the client configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Missing required configuration value.
    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    /// Invalid security protocol specified.
    #[error("Invalid security protocol: {0}")]
    InvalidSecurityProtocol(String),

    /// Invalid SASL mechanism specified.
    #[error("Invalid SASL mechanism: {0}")]
    InvalidSaslMechanism(String),
}

/// Security protocol for the Kafka connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SecurityProtocol {
    /// No encryption or authentication.
    #[default]
    Plaintext,
    /// TLS encryption without SASL.
    Ssl,
    /// SASL authentication without TLS.
    SaslPlaintext,
    /// SASL authentication with TLS encryption.
    SaslSsl,
}

impl SecurityProtocol {
    /// Returns the Kafka configuration string for this protocol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plaintext => "PLAINTEXT",
            Self::Ssl => "SSL",
            Self::SaslPlaintext => "SASL_PLAINTEXT",
            Self::SaslSsl => "SASL_SSL",
        }
    }

    /// Parses a protocol name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_uppercase().as_str() {
            "PLAINTEXT" => Ok(Self::Plaintext),
            "SSL" => Ok(Self::Ssl),
            "SASL_PLAINTEXT" => Ok(Self::SaslPlaintext),
            "SASL_SSL" => Ok(Self::SaslSsl),
            _ => Err(ConfigError::InvalidSecurityProtocol(value.to_string())),
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(self, Self::SaslPlaintext | Self::SaslSsl)
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN mechanism (username/password in clear text).
    Plain,
    /// SCRAM-SHA-256 mechanism.
    #[default]
    ScramSha256,
    /// SCRAM-SHA-512 mechanism.
    ScramSha512,
}

impl SaslMechanism {
    /// Returns the Kafka configuration string for this mechanism.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::ScramSha512 => "SCRAM-SHA-512",
        }
    }

    /// Parses a mechanism name, case-insensitively.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_uppercase().as_str() {
            "PLAIN" => Ok(Self::Plain),
            "SCRAM-SHA-256" => Ok(Self::ScramSha256),
            "SCRAM-SHA-512" => Ok(Self::ScramSha512),
            _ => Err(ConfigError::InvalidSaslMechanism(value.to_string())),
        }
    }
}

/// SASL credentials.
#[derive(Debug, Clone)]
pub struct SaslConfig {
    pub mechanism: SaslMechanism,
    pub username: String,
    pub password: String,
}

/// TLS certificate locations.
#[derive(Debug, Clone, Default)]
pub struct SslConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
}

/// Connection settings shared by every consumer and producer of a broker.
#[derive(Debug, Clone)]
pub struct KafkaClientConfig {
    /// Kafka broker addresses (comma-separated).
    pub brokers: String,

    /// Client id reported to the brokers.
    pub client_id: String,

    pub security_protocol: SecurityProtocol,
    pub sasl_config: Option<SaslConfig>,
    pub ssl_config: Option<SslConfig>,

    /// Auto offset reset policy ("earliest" or "latest").
    pub auto_offset_reset: String,

    pub enable_auto_commit: bool,
    pub session_timeout: Duration,

    /// Longest a single poll waits for the first record.
    pub poll_timeout: Duration,

    /// Upper bound on records returned by one poll.
    pub max_batch_size: usize,
}

impl KafkaClientConfig {
    /// Creates a plaintext configuration with defaults.
    pub fn new(brokers: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            client_id: "cdc-interceptor".to_string(),
            security_protocol: SecurityProtocol::default(),
            sasl_config: None,
            ssl_config: None,
            auto_offset_reset: "latest".to_string(),
            enable_auto_commit: true,
            session_timeout: Duration::from_secs(30),
            poll_timeout: Duration::from_millis(1000),
            max_batch_size: 500,
        }
    }

    /// Builds the configuration from the YAML broker section.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unknown protocols or mechanisms, or when SASL
    /// is requested without credentials.
    pub fn from_settings(settings: &BrokerSettings) -> Result<Self, ConfigError> {
        let mut config = Self::new(&settings.brokers)
            .with_client_id(&settings.client_id)
            .with_auto_offset_reset(&settings.auto_offset_reset)
            .with_poll_timeout(Duration::from_millis(settings.poll_timeout_ms));
        config.max_batch_size = settings.max_batch_size.max(1);

        if let Some(security) = &settings.security {
            config = config.apply_security(security)?;
        }
        Ok(config)
    }

    fn apply_security(mut self, security: &KafkaSecurityConfig) -> Result<Self, ConfigError> {
        debug!(protocol = %security.protocol, "Applying security configuration");
        self.security_protocol = SecurityProtocol::parse(&security.protocol)?;

        if self.security_protocol.uses_sasl() || security.sasl_mechanism.is_some() {
            let mechanism = match &security.sasl_mechanism {
                Some(m) => SaslMechanism::parse(m)?,
                None => SaslMechanism::default(),
            };
            let username = security
                .sasl_username
                .clone()
                .ok_or_else(|| ConfigError::MissingConfig("sasl_username".to_string()))?;
            let password = security
                .sasl_password
                .clone()
                .or_else(|| std::env::var("KAFKA_SASL_PASSWORD").ok())
                .ok_or_else(|| {
                    ConfigError::MissingConfig(
                        "sasl_password (or KAFKA_SASL_PASSWORD env var)".to_string(),
                    )
                })?;
            self.sasl_config = Some(SaslConfig {
                mechanism,
                username,
                password,
            });
        }

        if security.ssl_ca_location.is_some()
            || security.ssl_certificate_location.is_some()
            || security.ssl_key_location.is_some()
        {
            self.ssl_config = Some(SslConfig {
                ca_location: security.ssl_ca_location.clone(),
                certificate_location: security.ssl_certificate_location.clone(),
                key_location: security.ssl_key_location.clone(),
            });
        }

        Ok(self)
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Configures SASL/SCRAM-SHA-256 over TLS.
    pub fn with_sasl_scram_sha256(mut self, username: &str, password: &str) -> Self {
        self.security_protocol = SecurityProtocol::SaslSsl;
        self.sasl_config = Some(SaslConfig {
            mechanism: SaslMechanism::ScramSha256,
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Configures TLS with a CA certificate.
    pub fn with_ssl(mut self, ca_location: &str) -> Self {
        self.ssl_config = Some(SslConfig {
            ca_location: Some(ca_location.to_string()),
            ..SslConfig::default()
        });
        self
    }

    pub fn with_auto_offset_reset(mut self, policy: &str) -> Self {
        self.auto_offset_reset = policy.to_string();
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Settings common to consumers and producers.
    pub fn common_settings(&self) -> Vec<(String, String)> {
        let mut settings = vec![
            ("bootstrap.servers".to_string(), self.brokers.clone()),
            ("client.id".to_string(), self.client_id.clone()),
            (
                "security.protocol".to_string(),
                self.security_protocol.as_str().to_string(),
            ),
        ];

        if let Some(sasl) = &self.sasl_config {
            settings.push((
                "sasl.mechanism".to_string(),
                sasl.mechanism.as_str().to_string(),
            ));
            settings.push(("sasl.username".to_string(), sasl.username.clone()));
            settings.push(("sasl.password".to_string(), sasl.password.clone()));
        }

        if let Some(ssl) = &self.ssl_config {
            if let Some(ca) = &ssl.ca_location {
                settings.push(("ssl.ca.location".to_string(), ca.clone()));
            }
            if let Some(cert) = &ssl.certificate_location {
                settings.push(("ssl.certificate.location".to_string(), cert.clone()));
            }
            if let Some(key) = &ssl.key_location {
                settings.push(("ssl.key.location".to_string(), key.clone()));
            }
        }

        settings
    }

    /// Consumer settings for one consumer group.
    pub fn consumer_settings(&self, group_id: &str) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.extend([
            ("group.id".to_string(), group_id.to_string()),
            (
                "auto.offset.reset".to_string(),
                self.auto_offset_reset.clone(),
            ),
            (
                "enable.auto.commit".to_string(),
                self.enable_auto_commit.to_string(),
            ),
            (
                "session.timeout.ms".to_string(),
                self.session_timeout.as_millis().to_string(),
            ),
            ("enable.partition.eof".to_string(), "false".to_string()),
        ]);
        settings
    }

    /// Producer settings.
    pub fn producer_settings(&self) -> Vec<(String, String)> {
        let mut settings = self.common_settings();
        settings.push(("message.timeout.ms".to_string(), "5000".to_string()));
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(settings: &'a [(String, String)], key: &str) -> Option<&'a str> {
        settings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_new_config_defaults() {
        let config = KafkaClientConfig::new("localhost:9092");
        assert_eq!(config.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.sasl_config.is_none());
        assert_eq!(config.auto_offset_reset, "latest");
        assert_eq!(config.poll_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_consumer_settings_include_group() {
        let config = KafkaClientConfig::new("kafka:9092").with_ssl("/etc/ca.pem");
        let settings = config.consumer_settings("interceptor-orders");
        assert_eq!(lookup(&settings, "group.id"), Some("interceptor-orders"));
        assert_eq!(lookup(&settings, "bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(lookup(&settings, "ssl.ca.location"), Some("/etc/ca.pem"));
    }

    #[test]
    fn test_producer_settings_have_no_group() {
        let settings = KafkaClientConfig::new("kafka:9092").producer_settings();
        assert!(lookup(&settings, "group.id").is_none());
        assert_eq!(lookup(&settings, "message.timeout.ms"), Some("5000"));
    }

    #[test]
    fn test_sasl_settings() {
        let config = KafkaClientConfig::new("kafka:9093").with_sasl_scram_sha256("user", "pass");
        let settings = config.common_settings();
        assert_eq!(lookup(&settings, "security.protocol"), Some("SASL_SSL"));
        assert_eq!(lookup(&settings, "sasl.mechanism"), Some("SCRAM-SHA-256"));
        assert_eq!(lookup(&settings, "sasl.username"), Some("user"));
    }

    #[test]
    fn test_from_settings_with_security() {
        let settings = BrokerSettings {
            security: Some(KafkaSecurityConfig {
                protocol: "sasl_ssl".to_string(),
                sasl_mechanism: Some("scram-sha-512".to_string()),
                sasl_username: Some("svc".to_string()),
                sasl_password: Some("pw".to_string()),
                ssl_ca_location: None,
                ssl_certificate_location: None,
                ssl_key_location: None,
            }),
            ..BrokerSettings::default()
        };
        let config = KafkaClientConfig::from_settings(&settings).unwrap();
        assert_eq!(config.security_protocol, SecurityProtocol::SaslSsl);
        let sasl = config.sasl_config.unwrap();
        assert_eq!(sasl.mechanism, SaslMechanism::ScramSha512);
        assert_eq!(sasl.username, "svc");
    }

    #[test]
    fn test_from_settings_rejects_unknown_protocol() {
        let settings = BrokerSettings {
            security: Some(KafkaSecurityConfig {
                protocol: "carrier-pigeon".to_string(),
                sasl_mechanism: None,
                sasl_username: None,
                sasl_password: None,
                ssl_ca_location: None,
                ssl_certificate_location: None,
                ssl_key_location: None,
            }),
            ..BrokerSettings::default()
        };
        assert!(matches!(
            KafkaClientConfig::from_settings(&settings),
            Err(ConfigError::InvalidSecurityProtocol(_))
        ));
    }

    #[test]
    fn test_sasl_without_username_fails() {
        let settings = BrokerSettings {
            security: Some(KafkaSecurityConfig {
                protocol: "SASL_PLAINTEXT".to_string(),
                sasl_mechanism: Some("PLAIN".to_string()),
                sasl_username: None,
                sasl_password: Some("pw".to_string()),
                ssl_ca_location: None,
                ssl_certificate_location: None,
                ssl_key_location: None,
            }),
            ..BrokerSettings::default()
        };
        assert!(matches!(
            KafkaClientConfig::from_settings(&settings),
            Err(ConfigError::MissingConfig(_))
        ));
    }
}
