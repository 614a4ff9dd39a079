//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations used by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Base directory for project files when a save names no directory.
    /// Default: ~/greenroom-projects
    #[serde(default = "PathsConfig::default_projects_dir")]
    pub projects_dir: PathBuf,

    /// Runtime state (rich-protocol app state for unsaved scopes).
    /// Default: ~/.local/share/greenroom
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,
}

impl PathsConfig {
    fn default_projects_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("greenroom-projects"))
            .unwrap_or_else(|| PathBuf::from("greenroom-projects"))
    }

    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/greenroom"))
            .unwrap_or_else(|| PathBuf::from(".local/share/greenroom"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            projects_dir: Self::default_projects_dir(),
            state_dir: Self::default_state_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// Log level or EnvFilter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// How supervised applications are launched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Shell used to interpret app commandlines.
    /// Default: /bin/sh
    #[serde(default = "LoaderConfig::default_shell")]
    pub shell: String,

    /// Terminal emulator prefix for apps flagged `terminal`.
    /// Default: xterm -e
    #[serde(default = "LoaderConfig::default_terminal")]
    pub terminal: String,
}

impl LoaderConfig {
    fn default_shell() -> String {
        "/bin/sh".to_string()
    }

    fn default_terminal() -> String {
        "xterm -e".to_string()
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            shell: Self::default_shell(),
            terminal: Self::default_terminal(),
        }
    }
}

/// Commands used to control the audio server.
///
/// The daemon never links against the server; it shells out to these and
/// learns about the outcome through the server event feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioServerConfig {
    /// Default: jack_control start
    #[serde(default = "AudioServerConfig::default_start_command")]
    pub start_command: String,

    /// Default: jack_control stop
    #[serde(default = "AudioServerConfig::default_stop_command")]
    pub stop_command: String,

    /// Invoked as `<connect_command> <port1> <port2>`.
    /// Default: jack_connect
    #[serde(default = "AudioServerConfig::default_connect_command")]
    pub connect_command: String,

    /// Invoked as `<disconnect_command> <port1> <port2>`.
    /// Default: jack_disconnect
    #[serde(default = "AudioServerConfig::default_disconnect_command")]
    pub disconnect_command: String,
}

impl AudioServerConfig {
    fn default_start_command() -> String {
        "jack_control start".to_string()
    }

    fn default_stop_command() -> String {
        "jack_control stop".to_string()
    }

    fn default_connect_command() -> String {
        "jack_connect".to_string()
    }

    fn default_disconnect_command() -> String {
        "jack_disconnect".to_string()
    }
}

impl Default for AudioServerConfig {
    fn default() -> Self {
        Self {
            start_command: Self::default_start_command(),
            stop_command: Self::default_stop_command(),
            connect_command: Self::default_connect_command(),
            disconnect_command: Self::default_disconnect_command(),
        }
    }
}

/// Complete infrastructure configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub loader: LoaderConfig,

    #[serde(default)]
    pub audio_server: AudioServerConfig,
}
