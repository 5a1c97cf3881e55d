//! Handler configuration: file loading and typed key lookup.
//!
//! Two access paths are provided:
//!
//! - [`ConfigLoader`] deserializes any serde type from a TOML file. Used for
//!   the `[shared]` section (logging, service name).
//! - [`ConfigSource`] is the typed `get(key)` lookup the protocol engine
//!   consumes. [`TomlConfig`] implements it over the `[handler]` table.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "debug"
//! service_name = "handler-01"
//!
//! [handler]
//! model = "seiko-ns6040"
//! site-count = 4
//! polling-mode = "interrupt"
//! verify-bins = true
//! reprobe-bin = 15
//! workaround-list = ["poll-after-srq"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Why a configuration file could not be used.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// No file at the given path.
    #[error("Handler configuration file not found")]
    FileNotFound,

    /// Unreadable file or invalid TOML.
    #[error("Cannot parse handler configuration: {0}")]
    ParseError(String),

    /// Well-formed TOML with unusable content.
    #[error("Invalid handler configuration: {0}")]
    ValidationError(String),
}

/// Default verbosity of the driver log, written lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Every transport step.
    Trace,
    /// Commands, replies and decoding decisions.
    Debug,
    /// Session lifecycle.
    #[default]
    Info,
    /// Recoverable protocol anomalies.
    Warn,
    /// Failed operations.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared by every handler service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Default log verbosity; `RUST_LOG` and `-v` override it.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Name of this driver instance in logs and the run summary.
    pub service_name: String,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            service_name: crate::consts::HANDLER_SERVICE_NAME.to_string(),
        }
    }
}

impl SharedConfig {
    /// Reject an empty `service_name`.
    ///
    /// # Errors
    /// `ConfigError::ValidationError`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "[shared] service_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deserialize a whole TOML file into `Self`.
///
/// A missing file is `ConfigError::FileNotFound`; unreadable or invalid
/// content is `ConfigError::ParseError`.
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Read and deserialize `path`.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = read_config_file(path)?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any deserializable layout can be read this way.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound
        } else {
            ConfigError::ParseError(e.to_string())
        }
    })
}

/// A single configuration value as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// Free text (model names, modes, workaround names).
    Str(String),
    /// Any numeric value. Integers are widened.
    Num(f64),
    /// Flag.
    Bool(bool),
    /// Ordered list (activation patterns, workaround lists).
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::String(s) => Some(Self::Str(s.clone())),
            toml::Value::Integer(i) => Some(Self::Num(*i as f64)),
            toml::Value::Float(f) => Some(Self::Num(*f)),
            toml::Value::Boolean(b) => Some(Self::Bool(*b)),
            toml::Value::Array(items) => Some(Self::List(
                items.iter().filter_map(Self::from_toml).collect(),
            )),
            toml::Value::Datetime(_) | toml::Value::Table(_) => {
                tracing::debug!(value = %value, "Ignoring config value of unsupported type");
                None
            }
        }
    }

    /// String content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric content, if this is a number.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Self::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content. Accepts `"yes"`/`"no"` strings and `0`/`1` as well.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Num(n) => Some(*n != 0.0),
            Self::Str(s) => match s.to_ascii_lowercase().as_str() {
                "yes" | "true" | "on" => Some(true),
                "no" | "false" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Typed key lookup consumed by the reconfiguration orchestrator.
///
/// Keys are stable strings (`polling-mode`, `reprobe-bin`, ...). A missing
/// key returns `None`; callers decide whether a default applies.
pub trait ConfigSource {
    /// Look up a raw value.
    fn get(&self, key: &str) -> Option<ConfigValue>;

    /// Look up a string value.
    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    /// Look up a numeric value.
    fn get_num(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_num())
    }

    /// Look up a boolean value.
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| v.as_bool())
    }

    /// Look up a list value. A scalar is returned as a one-element list.
    fn get_list(&self, key: &str) -> Option<Vec<ConfigValue>> {
        match self.get(key)? {
            ConfigValue::List(items) => Some(items),
            other => Some(vec![other]),
        }
    }
}

/// [`ConfigSource`] backed by a TOML table.
///
/// When the document has a `[handler]` table, keys are looked up there;
/// otherwise the document root is used.
#[derive(Debug, Clone, Default)]
pub struct TomlConfig {
    table: toml::Table,
}

impl TomlConfig {
    /// Section name holding the driver keys.
    pub const SECTION: &'static str = "handler";

    /// Parse from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut root: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))?;
        let table = match root.remove(Self::SECTION) {
            Some(toml::Value::Table(section)) => section,
            Some(_) => {
                return Err(ConfigError::ValidationError(format!(
                    "[{}] must be a table",
                    Self::SECTION
                )));
            }
            None => {
                tracing::debug!("No [{}] table, reading driver keys from the document root", Self::SECTION);
                root
            }
        };
        Ok(Self { table })
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read_config_file(path)?)
    }

    /// Override or add a key (command line overrides).
    pub fn set(&mut self, key: &str, value: toml::Value) {
        self.table.insert(key.to_string(), value);
    }
}

impl ConfigSource for TomlConfig {
    fn get(&self, key: &str) -> Option<ConfigValue> {
        self.table.get(key).and_then(ConfigValue::from_toml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
        assert_eq!(LogLevel::Warn.as_directive(), "warn");
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(SharedConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_loader_file_not_found() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct TestConfig {
            shared: SharedConfig,
        }

        let result = TestConfig::load(Path::new("/nonexistent/path/handler.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_toml_config_reads_handler_section() {
        let cfg = TomlConfig::from_toml_str(
            r#"
[shared]
service_name = "h1"

[handler]
model = "delta-castle"
site-count = 4
verify-bins = "yes"
workaround-list = ["poll-after-srq", "skip-site-check"]
"#,
        )
        .unwrap();

        assert_eq!(cfg.get_str("model").as_deref(), Some("delta-castle"));
        assert_eq!(cfg.get_num("site-count"), Some(4.0));
        assert_eq!(cfg.get_bool("verify-bins"), Some(true));
        assert_eq!(cfg.get_list("workaround-list").unwrap().len(), 2);
        assert!(cfg.get("service_name").is_none());
    }

    #[test]
    fn test_toml_config_root_fallback_and_scalar_list() {
        let cfg = TomlConfig::from_toml_str("workaround-list = \"legacy-bin-command\"").unwrap();
        let list = cfg.get_list("workaround-list").unwrap();
        assert_eq!(list, vec![ConfigValue::Str("legacy-bin-command".into())]);
    }

    #[test]
    fn test_toml_config_rejects_non_table_section() {
        let result = TomlConfig::from_toml_str("handler = 3");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_toml_config_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[handler]\npolling-interval-us = 1500\n").unwrap();
        file.flush().unwrap();

        let cfg = TomlConfig::load(file.path()).unwrap();
        assert_eq!(cfg.get_num("polling-interval-us"), Some(1500.0));
    }

    #[test]
    fn test_toml_config_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();
        assert!(matches!(
            TomlConfig::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
