//! Configuration loading for the greenroom session daemon.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): paths, log level, how apps are
//!   launched and how the audio server is driven. Fixed for the life of the
//!   process.
//!
//! - **Bootstrap** (`BootstrapConfig`): the initial studio name and startup
//!   behaviour. After startup, the running studio is the source of truth.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/greenroom/config.toml` (system)
//! 2. `~/.config/greenroom/config.toml` (user)
//! 3. `./greenroom.toml` or the `--config` path (local override)
//! 4. Environment variables (`GREENROOM_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! projects_dir = "~/greenroom-projects"
//! state_dir = "~/.local/share/greenroom"
//!
//! [telemetry]
//! log_level = "info"
//!
//! [loader]
//! shell = "/bin/sh"
//! terminal = "xterm -e"
//!
//! [audio_server]
//! start_command = "jack_control start"
//! stop_command = "jack_control stop"
//!
//! [studio]
//! name = "greenroom"
//! pump_interval_ms = 100
//! autostart = false
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, StudioConfig};
pub use infra::{AudioServerConfig, InfraConfig, LoaderConfig, PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete greenroom configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GreenConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(flatten)]
    pub bootstrap: BootstrapConfig,
}

impl GreenConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an optional explicit file, then apply env
    /// overrides. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = GreenConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# greenroom configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "projects_dir = \"{}\"\n",
            self.infra.paths.projects_dir.display()
        ));
        output.push_str(&format!(
            "state_dir = \"{}\"\n",
            self.infra.paths.state_dir.display()
        ));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));

        output.push_str("\n[loader]\n");
        output.push_str(&format!("shell = \"{}\"\n", self.infra.loader.shell));
        output.push_str(&format!("terminal = \"{}\"\n", self.infra.loader.terminal));

        output.push_str("\n[audio_server]\n");
        let server = &self.infra.audio_server;
        output.push_str(&format!("start_command = \"{}\"\n", server.start_command));
        output.push_str(&format!("stop_command = \"{}\"\n", server.stop_command));
        output.push_str(&format!("connect_command = \"{}\"\n", server.connect_command));
        output.push_str(&format!(
            "disconnect_command = \"{}\"\n",
            server.disconnect_command
        ));

        output.push_str("\n[studio]\n");
        let studio = &self.bootstrap.studio;
        output.push_str(&format!("name = \"{}\"\n", studio.name));
        output.push_str(&format!("pump_interval_ms = {}\n", studio.pump_interval_ms));
        output.push_str(&format!("autostart = {}\n", studio.autostart));

        output
    }
}
