//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/labdev.toml` (or another file given to [`LabConfig::load_from`])
//! 2. Environment variables prefixed with `LABDEV_`, nested keys separated by `__`
//!    (e.g. `LABDEV_APPLICATION__LOG_LEVEL=debug`, `LABDEV_DEFAULTS__TIMEOUT_MS=500`)
//!
//! # Example
//! ```no_run
//! use lab_devices::config::LabConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LabConfig::load()?;
//! config.validate()?;
//! for device in config.enabled_devices() {
//!     println!("{} -> {}", device.id, device.connection.resource());
//! }
//! # Ok(())
//! # }
//! ```

use crate::backend::ConnectionParams;
use crate::definition::DeviceDefinition;
use crate::device::{Device, DeviceOptions, DeviceType};
use crate::drivers;
use crate::error::{DeviceError, DeviceResult};
use crate::logging::{parse_log_level, OutputFormat};
use crate::poller::{PollRate, PollerConfig};
use crate::value::Value;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/labdev.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Defaults for every device
    pub defaults: DefaultsConfig,
    /// Configured devices
    pub devices: Vec<DeviceConfig>,
    /// Directory of the loaded file; relative definition paths resolve against it
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "labdev".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Device defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Backend I/O timeout in milliseconds
    pub timeout_ms: u64,
    /// How long stopping a poller may take, in milliseconds
    pub stop_timeout_ms: u64,
    /// Poll rate in Hz; unset polls continuously
    pub poll_rate_hz: Option<f64>,
    /// Result queue capacity
    pub max_queue_size: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            stop_timeout_ms: 5000,
            poll_rate_hz: None,
            max_queue_size: 1000,
        }
    }
}

/// One configured device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub id: String,
    /// Catalog driver type (e.g. "minicircuits_rcdat")
    #[serde(default)]
    pub driver: Option<String>,
    /// TOML instrument definition, instead of a catalog driver
    #[serde(default)]
    pub definition: Option<PathBuf>,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to reach the instrument
    pub connection: ConnectionParams,
    /// Overrides `defaults.timeout_ms`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Overrides `defaults.stop_timeout_ms`
    #[serde(default)]
    pub stop_timeout_ms: Option<u64>,
    /// Overrides `defaults.poll_rate_hz`
    #[serde(default)]
    pub poll_rate_hz: Option<f64>,
    /// Overrides `defaults.max_queue_size`
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    /// Attribute values applied after connecting, in name order
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl LabConfig {
    /// Load from `config/labdev.toml` and the environment.
    ///
    /// Environment variables override the file with prefix `LABDEV_`.
    /// Example: `LABDEV_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> DeviceResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path. A missing file leaves the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DeviceResult<Self> {
        let path = path.as_ref();
        let mut config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LABDEV_").split("__"))
            .extract()?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        debug!(path = %path.display(), devices = config.devices.len(), "configuration loaded");
        Ok(config)
    }

    /// Check the configuration after loading.
    pub fn validate(&self) -> DeviceResult<()> {
        parse_log_level(&self.application.log_level)?;
        self.application.log_format.parse::<OutputFormat>()?;

        let invalid = |msg: String| Err(DeviceError::Configuration(msg));
        if self.defaults.timeout_ms == 0 {
            return invalid("defaults.timeout_ms must be positive".to_string());
        }
        if self.defaults.stop_timeout_ms == 0 {
            return invalid("defaults.stop_timeout_ms must be positive".to_string());
        }
        if self.defaults.max_queue_size == 0 {
            return invalid("defaults.max_queue_size must be positive".to_string());
        }
        PollRate::from_hz(self.defaults.poll_rate_hz)?;

        let mut ids = HashSet::new();
        for device in &self.devices {
            if !ids.insert(device.id.as_str()) {
                return invalid(format!("Duplicate device ID: {}", device.id));
            }
            device.validate()?;
        }
        Ok(())
    }

    /// All enabled devices
    #[must_use]
    pub fn enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    /// Find a device by id.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Options for a device: defaults, then its overrides.
    pub fn device_options(&self, device: &DeviceConfig) -> DeviceResult<DeviceOptions> {
        let d = &self.defaults;
        Ok(DeviceOptions {
            timeout: Duration::from_millis(device.timeout_ms.unwrap_or(d.timeout_ms)),
            stop_timeout: Duration::from_millis(device.stop_timeout_ms.unwrap_or(d.stop_timeout_ms)),
            poller: PollerConfig {
                poll_rate: PollRate::from_hz(device.poll_rate_hz.or(d.poll_rate_hz))?,
                max_queue_size: device.max_queue_size.unwrap_or(d.max_queue_size),
            },
        })
    }

    /// Device type named by a configuration entry.
    pub fn device_type(&self, device: &DeviceConfig) -> DeviceResult<Arc<DeviceType>> {
        match (&device.driver, &device.definition) {
            (Some(driver), None) => drivers::device_type(driver),
            (None, Some(path)) => {
                let path = match &self.base_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                DeviceDefinition::load_file(&path)?.into_device_type()
            }
            _ => Err(DeviceError::Configuration(format!(
                "device '{}' needs exactly one of 'driver' or 'definition'",
                device.id
            ))),
        }
    }

    /// Build an unconnected device from a configuration entry.
    ///
    /// Simulated connections of catalog drivers are backed by the driver's simulator.
    pub fn build_device(&self, device: &DeviceConfig) -> DeviceResult<Device> {
        let device_type = self.device_type(device)?;
        let mut connection = device.connection.clone();
        if let (ConnectionParams::Simulated(params), Some(driver)) = (&mut connection, &device.driver) {
            if let Some(factory) = drivers::lookup(driver) {
                params.instrument = factory.simulator();
            }
        }
        Ok(Device::new(&device.id, device_type, connection)
            .with_options(self.device_options(device)?))
    }
}

impl DeviceConfig {
    fn validate(&self) -> DeviceResult<()> {
        let invalid = |msg: &str| Err(DeviceError::Configuration(format!("device '{}' {msg}", self.id)));
        if self.id.trim().is_empty() {
            return Err(DeviceError::Configuration("device id must not be empty".to_string()));
        }
        match (&self.driver, &self.definition) {
            (Some(driver), None) => {
                if drivers::lookup(driver).is_none() {
                    return invalid(&format!("uses unknown driver '{driver}'"));
                }
            }
            (None, Some(_)) => {}
            _ => return invalid("needs exactly one of 'driver' or 'definition'"),
        }
        if self.timeout_ms == Some(0) || self.stop_timeout_ms == Some(0) {
            return invalid("timeouts must be positive");
        }
        if self.max_queue_size == Some(0) {
            return invalid("max_queue_size must be positive");
        }
        if self.poll_rate_hz.is_some() {
            PollRate::from_hz(self.poll_rate_hz)?;
        }
        self.connection.validate()
    }

    /// Settings as typed values, validated against the device type.
    pub fn settings_for(&self, device_type: &DeviceType) -> DeviceResult<Vec<(String, Value)>> {
        self.settings
            .iter()
            .map(|(name, value)| {
                let descriptor = device_type
                    .registry()
                    .get(name)
                    .ok_or_else(|| DeviceError::UnknownAttribute(name.clone()))?;
                Ok((name.clone(), descriptor.validate(value)?))
            })
            .collect()
    }
}
