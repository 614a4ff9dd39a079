//! Config file discovery, loading, and environment variable overlay.

use crate::bootstrap::StudioConfig;
use crate::infra::{AudioServerConfig, LoaderConfig, PathsConfig, TelemetryConfig};
use crate::{BootstrapConfig, ConfigError, GreenConfig, InfraConfig};
use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/greenroom/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("greenroom/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("greenroom.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<GreenConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Decode one `[section]` of the file, falling back to defaults when absent.
fn section<T>(table: &toml::Table, name: &str, path: &Path) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Default,
{
    match table.get(name) {
        Some(value) => value.clone().try_into().map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: format!("[{}]: {}", name, e),
        }),
        None => Ok(T::default()),
    }
}

/// Parse config from TOML string.
pub(crate) fn parse_toml(contents: &str, path: &Path) -> Result<GreenConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut paths: PathsConfig = section(&table, "paths", path)?;
    // Paths are written with ~ or $VAR in files; serde only sees the raw text.
    paths.projects_dir = expand_path(&paths.projects_dir.to_string_lossy());
    paths.state_dir = expand_path(&paths.state_dir.to_string_lossy());

    let infra = InfraConfig {
        paths,
        telemetry: section(&table, "telemetry", path)?,
        loader: section(&table, "loader", path)?,
        audio_server: section(&table, "audio_server", path)?,
    };

    let bootstrap = BootstrapConfig {
        studio: section(&table, "studio", path)?,
    };

    Ok(GreenConfig { infra, bootstrap })
}

/// Keep `overlay` unless it still holds the compiled default.
fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
    if overlay != default {
        overlay
    } else {
        base
    }
}

/// Merge two configs, with `overlay` taking precedence field by field.
pub fn merge_configs(base: GreenConfig, overlay: GreenConfig) -> GreenConfig {
    let paths_default = PathsConfig::default();
    let telemetry_default = TelemetryConfig::default();
    let loader_default = LoaderConfig::default();
    let server_default = AudioServerConfig::default();
    let studio_default = StudioConfig::default();

    let (b, o) = (base.infra, overlay.infra);
    let (bs, os) = (base.bootstrap.studio, overlay.bootstrap.studio);

    GreenConfig {
        infra: InfraConfig {
            paths: PathsConfig {
                projects_dir: pick(b.paths.projects_dir, o.paths.projects_dir, paths_default.projects_dir),
                state_dir: pick(b.paths.state_dir, o.paths.state_dir, paths_default.state_dir),
            },
            telemetry: TelemetryConfig {
                log_level: pick(b.telemetry.log_level, o.telemetry.log_level, telemetry_default.log_level),
            },
            loader: LoaderConfig {
                shell: pick(b.loader.shell, o.loader.shell, loader_default.shell),
                terminal: pick(b.loader.terminal, o.loader.terminal, loader_default.terminal),
            },
            audio_server: AudioServerConfig {
                start_command: pick(
                    b.audio_server.start_command,
                    o.audio_server.start_command,
                    server_default.start_command,
                ),
                stop_command: pick(
                    b.audio_server.stop_command,
                    o.audio_server.stop_command,
                    server_default.stop_command,
                ),
                connect_command: pick(
                    b.audio_server.connect_command,
                    o.audio_server.connect_command,
                    server_default.connect_command,
                ),
                disconnect_command: pick(
                    b.audio_server.disconnect_command,
                    o.audio_server.disconnect_command,
                    server_default.disconnect_command,
                ),
            },
        },
        bootstrap: BootstrapConfig {
            studio: StudioConfig {
                name: pick(bs.name, os.name, studio_default.name),
                pump_interval_ms: pick(bs.pump_interval_ms, os.pump_interval_ms, studio_default.pump_interval_ms),
                autostart: bs.autostart || os.autostart,
            },
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut GreenConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("GREENROOM_PROJECTS_DIR") {
        config.infra.paths.projects_dir = expand_path(&v);
        sources.env_overrides.push("GREENROOM_PROJECTS_DIR".to_string());
    }
    if let Ok(v) = env::var("GREENROOM_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("GREENROOM_STATE_DIR".to_string());
    }

    if let Ok(v) = env::var("GREENROOM_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("GREENROOM_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("GREENROOM_TERMINAL") {
        config.infra.loader.terminal = v;
        sources.env_overrides.push("GREENROOM_TERMINAL".to_string());
    }

    if let Ok(v) = env::var("GREENROOM_STUDIO_NAME") {
        config.bootstrap.studio.name = v;
        sources.env_overrides.push("GREENROOM_STUDIO_NAME".to_string());
    }
    if let Ok(v) = env::var("GREENROOM_AUTOSTART") {
        if let Ok(flag) = v.parse() {
            config.bootstrap.studio.autostart = flag;
            sources.env_overrides.push("GREENROOM_AUTOSTART".to_string());
        }
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/projects/live");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().ends_with("projects/live"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/srv/greenroom"), PathBuf::from("/srv/greenroom"));
    }

    #[test]
    fn test_expand_path_unknown_var_is_left_alone() {
        let expanded = expand_path("$GREENROOM_SURELY_UNSET_VAR/x");
        assert_eq!(expanded, PathBuf::from("$GREENROOM_SURELY_UNSET_VAR/x"));
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[paths]
projects_dir = "/custom/projects"
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.infra.paths.projects_dir, PathBuf::from("/custom/projects"));
        assert_eq!(config.infra.loader.shell, "/bin/sh");
        assert_eq!(config.bootstrap.studio.pump_interval_ms, 100);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[paths]
projects_dir = "/data/projects"
state_dir = "/data/state"

[telemetry]
log_level = "debug"

[loader]
terminal = "urxvt -e"

[audio_server]
start_command = "pw-jack true"

[studio]
name = "live rig"
pump_interval_ms = 25
autostart = true
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();

        assert_eq!(config.infra.paths.state_dir, PathBuf::from("/data/state"));
        assert_eq!(config.infra.telemetry.log_level, "debug");
        assert_eq!(config.infra.loader.terminal, "urxvt -e");
        assert_eq!(config.infra.loader.shell, "/bin/sh");
        assert_eq!(config.infra.audio_server.start_command, "pw-jack true");
        assert_eq!(config.infra.audio_server.stop_command, "jack_control stop");
        assert_eq!(config.bootstrap.studio.name, "live rig");
        assert_eq!(config.bootstrap.studio.pump_interval_ms, 25);
        assert!(config.bootstrap.studio.autostart);
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let toml = r#"
[studio]
pump_interval_ms = "fast"
"#;
        let err = parse_toml(toml, Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("[studio]"));
    }

    #[test]
    fn test_merge_keeps_base_when_overlay_is_default() {
        let base = parse_toml("[loader]\nterminal = \"kitty\"\n", Path::new("a.toml")).unwrap();
        let overlay = parse_toml("[studio]\nname = \"b\"\n", Path::new("b.toml")).unwrap();

        let merged = merge_configs(base, overlay);
        assert_eq!(merged.infra.loader.terminal, "kitty");
        assert_eq!(merged.bootstrap.studio.name, "b");
    }
}
