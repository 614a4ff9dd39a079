//! Bootstrap configuration - seeds runtime state, then runtime owns it.

use serde::{Deserialize, Serialize};

/// Initial studio settings.
///
/// The studio can be renamed and started/stopped over RPC; these only
/// decide what happens at daemon startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudioConfig {
    /// Studio name, also the supervisor name handed to launched apps.
    #[serde(default = "StudioConfig::default_name")]
    pub name: String,

    /// How often the command queue is pumped when no event arrives.
    #[serde(default = "StudioConfig::default_pump_interval_ms")]
    pub pump_interval_ms: u64,

    /// Queue a studio start as soon as the daemon is up.
    #[serde(default)]
    pub autostart: bool,
}

impl StudioConfig {
    fn default_name() -> String {
        "greenroom".to_string()
    }

    fn default_pump_interval_ms() -> u64 {
        100
    }
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            pump_interval_ms: Self::default_pump_interval_ms(),
            autostart: false,
        }
    }
}

/// Complete bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub studio: StudioConfig,
}
