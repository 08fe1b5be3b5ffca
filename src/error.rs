// src/error.rs
//
// Error taxonomy for the gateway.
//
// Fatal errors (configuration, transport init, credential persistence during
// registration) unwind the gateway and surface a nonzero exit code. Runtime
// transport errors are logged at the point of failure and recovered through
// the link supervisors; they never appear here.

use thiserror::Error;

/// Configuration problems. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Credential file problems. Fatal when they occur while persisting a
/// freshly issued token; a registered token that cannot be stored is unsafe.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("credential file i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential file is malformed: {0}")]
    Malformed(#[from] toml::de::Error),

    #[error("credential file encoding: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Modbus link errors. Per-sensor read errors are logged by the poll task
/// and the schedule continues; I/O errors additionally drop the link.
#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("modbus link is down")]
    NotConnected,

    #[error("modbus i/o error: {0}")]
    Io(String),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("short read at register {register}: expected {expected} registers, got {got}")]
    ShortRead {
        register: u16,
        expected: usize,
        got: usize,
    },
}

/// Cloud link errors. Publication errors are logged without retry; the
/// broker session provides redelivery for transient failures.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud client error: {0}")]
    Client(String),

    #[error("cloud payload encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Invalid publication rule for the sensor it is attached to.
/// Fails the poll tick that evaluated it.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("threshold rule on a non-numeric sensor value")]
    ThresholdNotNumeric,
}

/// Top-level gateway error. Everything here is fatal.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport init failed: {0}")]
    Init(String),

    #[error("credential store failure: {0}")]
    Credentials(#[from] CredentialsError),
}

impl GatewayError {
    /// Process exit code for this failure. 0 is reserved for clean shutdown.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::Config(_) => 1,
            GatewayError::Init(_) => 2,
            GatewayError::Credentials(_) => 2,
        }
    }
}
