use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::registry::{ModbusSource, PublishRules, SensorRegistry, SensorSchema, ValueKind};

// ============================================================================
// Settings Model
// ============================================================================

/// Cloud endpoint settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CloudSettings {
    /// Broker URL, e.g. "mqtt://broker.example.com:1883"
    pub url: String,
    /// User-scoped access token presented when opening the channel
    pub user_token: String,
}

/// Modbus slave settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModbusSettings {
    /// Slave URL, e.g. "tcp://10.0.0.17:502"
    pub url: String,
    /// Modbus unit/slave ID (1-247)
    pub slave_id: u8,
}

/// One declared sensor.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SensorSpec {
    /// Sensor id, unique within the device
    pub id: u16,
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub unit: String,
    /// Protocol-level register address (0-based)
    pub register: u16,
    #[serde(default)]
    pub bit_offset: u8,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub publish: PublishRules,
}

/// Gateway settings, loaded from a TOML file before startup.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Human-readable device name declared to the cloud
    pub name: String,
    /// Path to the credential file
    pub credentials_path: String,
    pub cloud: CloudSettings,
    pub modbus: ModbusSettings,
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SensorSpec>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl GatewaySettings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: GatewaySettings =
            toml::from_str(&body).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply command line overrides on top of the file.
    pub fn apply_args(&mut self, cloud_url: Option<String>, modbus_url: Option<String>) {
        if let Some(url) = cloud_url {
            self.cloud.url = url;
        }
        if let Some(url) = modbus_url {
            self.modbus.url = url;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("device name is empty".to_string()));
        }
        if self.cloud.user_token.is_empty() {
            return Err(ConfigError::Invalid(
                "cloud.user_token is empty".to_string(),
            ));
        }
        if self.sensors.is_empty() {
            return Err(ConfigError::Invalid(
                "no sensors declared; nothing to poll".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for sensor in &self.sensors {
            if !seen.insert(sensor.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate sensor id {}",
                    sensor.id
                )));
            }
            if sensor.bit_offset > 15 {
                return Err(ConfigError::Invalid(format!(
                    "sensor {}: bit_offset {} exceeds a 16-bit register",
                    sensor.id, sensor.bit_offset
                )));
            }
        }
        Ok(())
    }

    /// Build the sensor registry declared by this config.
    pub fn build_registry(&self) -> SensorRegistry {
        let registry = SensorRegistry::new();
        for sensor in &self.sensors {
            registry.insert(
                sensor.id,
                SensorSchema {
                    kind: sensor.kind,
                    unit: sensor.unit.clone(),
                    name: sensor.name.clone(),
                },
                sensor.publish,
                ModbusSource {
                    register: sensor.register,
                    bit_offset: sensor.bit_offset,
                },
                Duration::from_millis(sensor.poll_interval_ms),
            );
        }
        registry
    }
}
