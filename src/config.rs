use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default loopback port for the relay.
pub const DEFAULT_PORT: u16 = 19222;

/// Default config file template with comments, used by `config init`.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# browserforce configuration file

# Relay settings
# [relay]
# host = "127.0.0.1"        # loopback only; the broker never binds elsewhere
# port = 19222
# log_capacity = 5000       # frame log ring size
# keepalive_secs = 5        # extension liveness interval
# missed_pong_limit = 2     # missed pongs before the link is closed
# command_timeout_ms = 30000
# client_queue = 256        # per-client outbound queue cap
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// Represents the parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub relay: RelaySection,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_capacity: Option<usize>,
    pub keepalive_secs: Option<u64>,
    pub missed_pong_limit: Option<u32>,
    pub command_timeout_ms: Option<u64>,
    pub client_queue: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved runtime config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved relay configuration the broker runs with.
#[derive(Debug, Clone)]
pub struct ResolvedRelay {
    pub host: String,
    pub port: u16,
    pub log_capacity: usize,
    pub keepalive: Duration,
    pub missed_pong_limit: u32,
    pub command_timeout: Duration,
    pub client_queue_capacity: usize,
    pub link_channel_capacity: usize,
    pub event_channel_capacity: usize,
    pub decode_fault_limit: u32,
    /// Directory holding the token, URL file, preference files, and plugins.
    pub config_dir: PathBuf,
}

impl ResolvedRelay {
    /// Built-in defaults rooted at the given config directory.
    #[must_use]
    pub fn with_dir(config_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_PORT,
            log_capacity: 5000,
            keepalive: Duration::from_secs(5),
            missed_pong_limit: 2,
            command_timeout: Duration::from_secs(30),
            client_queue_capacity: 256,
            link_channel_capacity: 256,
            event_channel_capacity: 256,
            decode_fault_limit: 10,
            config_dir,
        }
    }
}

/// Merge CLI/env and config-file values over the built-in defaults.
///
/// Precedence per field: CLI flag (clap also maps `RELAY_PORT` onto the
/// port argument) > config file > built-in default.
#[must_use]
pub fn resolve(port_flag: Option<u16>, file: &ConfigFile, config_dir: PathBuf) -> ResolvedRelay {
    let mut resolved = ResolvedRelay::with_dir(config_dir);
    if let Some(host) = &file.relay.host {
        resolved.host.clone_from(host);
    }
    resolved.port = port_flag.or(file.relay.port).unwrap_or(DEFAULT_PORT);
    if let Some(capacity) = file.relay.log_capacity {
        resolved.log_capacity = capacity.max(1);
    }
    if let Some(secs) = file.relay.keepalive_secs {
        resolved.keepalive = Duration::from_secs(secs.max(1));
    }
    if let Some(limit) = file.relay.missed_pong_limit {
        resolved.missed_pong_limit = limit.max(1);
    }
    if let Some(ms) = file.relay.command_timeout_ms {
        resolved.command_timeout = Duration::from_millis(ms.max(1));
    }
    if let Some(queue) = file.relay.client_queue {
        resolved.client_queue_capacity = queue.max(1);
    }
    resolved
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing config file.
    Io(std::io::Error),
    /// Config file already exists (for `config init`).
    AlreadyExists(PathBuf),
    /// Could not determine config directory.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::AlreadyExists(p) => {
                write!(f, "Config file already exists: {}", p.display())
            }
            Self::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for crate::error::AppError {
    fn from(e: ConfigError) -> Self {
        use crate::error::ExitCode;
        Self {
            message: e.to_string(),
            code: ExitCode::GeneralError,
        }
    }
}

// ---------------------------------------------------------------------------
// Config file search
// ---------------------------------------------------------------------------

/// Find the first config file that exists, checking locations in priority order.
///
/// Search order:
/// 1. `explicit_path` (from `--config` flag)
/// 2. `$BROWSERFORCE_CONFIG` environment variable
/// 3. `./.browserforce.toml` (project-local)
/// 4. `<config_dir>/browserforce/config.toml` (XDG / platform config dir)
/// 5. `~/.browserforce.toml` (home directory fallback)
#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("BROWSERFORCE_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(
    explicit_path: Option<&Path>,
    env_config: Option<String>,
) -> Option<PathBuf> {
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    let local = PathBuf::from(".browserforce.toml");
    if local.exists() {
        return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("browserforce").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    if let Some(home) = dirs::home_dir() {
        let fallback = home.join(".browserforce.toml");
        if fallback.exists() {
            return Some(fallback);
        }
    }

    None
}

/// Load the config file (if any), tolerating parse errors with a warning.
///
/// Returns the path used (if found) and the parsed file (default if absent
/// or unparseable).
#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let Some(path) = find_config_file(explicit_path) else {
        return (None, ConfigFile::default());
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => (Some(path), file),
            Err(e) => {
                eprintln!("warning: ignoring invalid config {}: {e}", path.display());
                (Some(path), ConfigFile::default())
            }
        },
        Err(e) => {
            eprintln!("warning: could not read config {}: {e}", path.display());
            (Some(path), ConfigFile::default())
        }
    }
}

/// Parse config contents. Testable core of [`load_config`].
///
/// # Errors
///
/// Returns the TOML error message if the contents are invalid.
pub fn parse_config(contents: &str) -> Result<ConfigFile, String> {
    toml::from_str(contents).map_err(|e| e.to_string())
}

/// Write a commented template config file for `config init`.
///
/// # Errors
///
/// Returns `ConfigError::AlreadyExists` if the target exists, or
/// `ConfigError::Io` on write failure.
pub fn init_config(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("browserforce")
            .join("config.toml"),
    };
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- parsing ---

    #[test]
    fn parse_empty_config_uses_defaults() {
        let file = parse_config("").unwrap();
        assert!(file.relay.port.is_none());
        assert!(file.relay.host.is_none());
    }

    #[test]
    fn parse_relay_section() {
        let file = parse_config(
            r"
            [relay]
            port = 20000
            log_capacity = 100
            keepalive_secs = 2
            ",
        )
        .unwrap();
        assert_eq!(file.relay.port, Some(20000));
        assert_eq!(file.relay.log_capacity, Some(100));
        assert_eq!(file.relay.keepalive_secs, Some(2));
    }

    #[test]
    fn parse_invalid_toml_errors() {
        assert!(parse_config("[relay\nport = ").is_err());
    }

    #[test]
    fn template_parses_cleanly() {
        assert!(parse_config(DEFAULT_CONFIG_TEMPLATE).is_ok());
    }

    // --- resolution ---

    #[test]
    fn resolve_defaults() {
        let resolved = resolve(None, &ConfigFile::default(), PathBuf::from("/tmp/bf"));
        assert_eq!(resolved.port, DEFAULT_PORT);
        assert_eq!(resolved.host, "127.0.0.1");
        assert_eq!(resolved.log_capacity, 5000);
        assert_eq!(resolved.keepalive, Duration::from_secs(5));
        assert_eq!(resolved.missed_pong_limit, 2);
        assert_eq!(resolved.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn cli_port_beats_config_file() {
        let file = parse_config("[relay]\nport = 20000\n").unwrap();
        let resolved = resolve(Some(21000), &file, PathBuf::from("/tmp/bf"));
        assert_eq!(resolved.port, 21000);
    }

    #[test]
    fn config_file_port_beats_default() {
        let file = parse_config("[relay]\nport = 20000\n").unwrap();
        let resolved = resolve(None, &file, PathBuf::from("/tmp/bf"));
        assert_eq!(resolved.port, 20000);
    }

    #[test]
    fn zero_capacities_are_clamped() {
        let file =
            parse_config("[relay]\nlog_capacity = 0\nclient_queue = 0\nmissed_pong_limit = 0\n")
                .unwrap();
        let resolved = resolve(None, &file, PathBuf::from("/tmp/bf"));
        assert_eq!(resolved.log_capacity, 1);
        assert_eq!(resolved.client_queue_capacity, 1);
        assert_eq!(resolved.missed_pong_limit, 1);
    }

    // --- file search ---

    #[test]
    fn explicit_path_wins_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "").unwrap();
        let found = find_config_file_with(Some(&path), None);
        assert_eq!(found, Some(path));
    }

    #[test]
    fn env_path_used_when_explicit_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.toml");
        std::fs::write(&path, "").unwrap();
        let found = find_config_file_with(
            Some(Path::new("/nonexistent/x.toml")),
            Some(path.display().to_string()),
        );
        assert_eq!(found, Some(path));
    }

    // --- init ---

    #[test]
    fn init_writes_template_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let created = init_config(Some(&path)).unwrap();
        assert_eq!(created, path);
        assert!(path.exists());

        let err = init_config(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::AlreadyExists(_)));
    }
}
