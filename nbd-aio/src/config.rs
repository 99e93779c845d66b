//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default per-connection in-flight command window.
///
/// The engine itself never caps the pending queue; this is the bound the
/// caller is expected to enforce before submitting.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Options for connecting to an export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Export name requested during negotiation.
    #[serde(default)]
    pub export_name: String,

    /// Number of independent connections to open ("multi-conn").
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Caller-enforced bound on commands in flight per connection.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_connections() -> usize {
    1
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            export_name: String::new(),
            connections: default_connections(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connections",
                reason: "must be at least 1",
            });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_in_flight",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}
