//! Rig configuration using Figment.
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `RIG_` (nesting separated by `__`)
//! 2. A TOML configuration file (default: `config/rig.toml`)
//!
//! ```text
//! RIG_APPLICATION__LOG_LEVEL=debug
//! RIG_SESSION__MAX_ATTEMPTS=5
//! ```
//!
//! Besides application and session settings, the file carries one
//! `[services.<key>]` table per service type or service name. Those tables are
//! the per-service settings applied during the Configure stage; see
//! [`ConfigMap::resolve`] for the layering rules.
//!
//! Figment lowercases environment keys, so `RIG_SERVICES__VideoCamera__FPS=30`
//! lands in a `services.videocamera` table. Service keys are matched
//! case-insensitively, which lets such a table override `[services.VideoCamera]`.

use crate::error::{RigError, RigResult, ServiceError};
use crate::service::Service;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RigConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session sequencing settings
    #[serde(default)]
    pub session: SessionSettings,
    /// Per-service settings keyed by service type or service name
    #[serde(default)]
    pub services: BTreeMap<String, ServiceSettings>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Rig name, used in logs
    #[serde(default = "default_rig_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_rig_name(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

/// Session sequencing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Attempts per service for Initialize+Test before escalating
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between Initialize+Test attempts in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Poll interval of running-state watchers in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Root directory under which session folders are created
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Service names forming the recorder group
    #[serde(default)]
    pub recorders: Vec<String>,
    /// Service names forming the stimulus group
    #[serde(default)]
    pub stimulus: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            poll_interval_ms: default_poll_interval(),
            data_root: default_data_root(),
            recorders: Vec::new(),
            stimulus: Vec::new(),
        }
    }
}

impl SessionSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_rig_name() -> String {
    "rig".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    250
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data/sessions")
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    pub fn load() -> RigResult<Self> {
        Self::load_from("config/rig.toml")
    }

    /// Load configuration from a specific file path, then validate it.
    ///
    /// A missing file is not an error: defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RigResult<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Parse configuration from an in-memory TOML document.
    pub fn from_toml_str(toml: &str) -> RigResult<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> RigResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed("RIG_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - `max_attempts` is at least 1
    /// - `poll_interval_ms` is at least 1
    /// - Group members are non-empty and unique within their group
    pub fn validate(&self) -> RigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.session.max_attempts == 0 {
            return Err(RigError::Configuration(
                "Invalid max_attempts 0. Must be at least 1".to_string(),
            ));
        }

        if self.session.poll_interval_ms == 0 {
            return Err(RigError::Configuration(
                "Invalid poll_interval_ms 0. Must be at least 1".to_string(),
            ));
        }

        for (group, members) in [
            ("recorders", &self.session.recorders),
            ("stimulus", &self.session.stimulus),
        ] {
            let mut seen = HashSet::new();
            for member in members {
                if member.is_empty() {
                    return Err(RigError::Configuration(format!(
                        "Group '{}' contains an empty service name",
                        group
                    )));
                }
                if !seen.insert(member) {
                    return Err(RigError::Configuration(format!(
                        "Group '{}' lists service '{}' twice",
                        group, member
                    )));
                }
            }
        }

        Ok(())
    }

    /// Renders the effective configuration, environment overrides included.
    pub fn to_toml_string(&self) -> RigResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RigError::Configuration(format!("Cannot render configuration: {}", e)))
    }

    /// Per-service settings as a [`ConfigMap`].
    pub fn service_settings(&self) -> ConfigMap {
        ConfigMap(self.services.clone())
    }
}

// ============================================================================
// Per-service settings
// ============================================================================

/// Flat `attribute = value` table handed to [`Configurable::configure`].
///
/// Services turn it into their own typed configuration with [`parse`] or
/// [`overlay`]; no attribute is ever set by name reflectively.
///
/// [`Configurable::configure`]: crate::capabilities::Configurable::configure
/// [`parse`]: ServiceSettings::parse
/// [`overlay`]: ServiceSettings::overlay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceSettings(BTreeMap<String, Value>);

impl ServiceSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Writes every entry of `other` over `self`; later writes win.
    pub fn merge(&mut self, other: &ServiceSettings) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Deserializes the table into a typed configuration.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        serde_json::from_value(Value::Object(self.0.clone().into_iter().collect()))
            .map_err(|e| ServiceError::InvalidSettings(e.to_string()))
    }

    /// Applies the table on top of `current` and returns the updated value.
    ///
    /// Attributes absent from the table keep their current value. Unknown
    /// attributes are rejected when `T` denies unknown fields.
    pub fn overlay<T>(&self, current: &T) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut object = match serde_json::to_value(current) {
            Ok(Value::Object(object)) => object,
            Ok(other) => {
                return Err(ServiceError::InvalidSettings(format!(
                    "cannot overlay settings onto non-table value {}",
                    other
                )))
            }
            Err(e) => return Err(ServiceError::InvalidSettings(e.to_string())),
        };
        for (key, value) in &self.0 {
            object.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(object))
            .map_err(|e| ServiceError::InvalidSettings(e.to_string()))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ServiceSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut settings = ServiceSettings::new();
        for (key, value) in iter {
            settings.insert(key, value);
        }
        settings
    }
}

/// Mapping from service type name or service name to its settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMap(BTreeMap<String, ServiceSettings>);

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, settings: ServiceSettings) -> Self {
        self.insert(key, settings);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, settings: ServiceSettings) {
        self.0.insert(key.into(), settings);
    }

    pub fn get(&self, key: &str) -> Option<&ServiceSettings> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merged settings for `service`, or `None` when no entry applies.
    ///
    /// Layers, later writes winning:
    /// 1. each type of the service's lineage, most general base first
    /// 2. the concrete type
    /// 3. the service's own name, when it differs from its type name
    ///
    /// Keys match case-insensitively. Within one layer the exact-case entry
    /// applies first, so a lowercased environment table overrides the file.
    pub fn resolve<S: Service + ?Sized>(&self, service: &S) -> Option<ServiceSettings> {
        let mut keys: Vec<&str> = service
            .service_type()
            .lineage()
            .into_iter()
            .map(|ty| ty.name)
            .collect();
        if !keys.iter().any(|key| key.eq_ignore_ascii_case(service.name())) {
            keys.push(service.name());
        }

        let mut merged: Option<ServiceSettings> = None;
        for key in keys {
            for layer in self.layers(key) {
                merged.get_or_insert_with(ServiceSettings::new).merge(layer);
            }
        }
        merged
    }

    fn layers<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a ServiceSettings> + 'a {
        let folded = self
            .0
            .iter()
            .filter(move |(candidate, _)| {
                candidate.as_str() != key && candidate.eq_ignore_ascii_case(key)
            })
            .map(|(_, settings)| settings);
        self.0.get(key).into_iter().chain(folded)
    }
}

impl From<BTreeMap<String, ServiceSettings>> for ConfigMap {
    fn from(map: BTreeMap<String, ServiceSettings>) -> Self {
        Self(map)
    }
}
