//! Default paths for rollcall components
//!
//! Paths are user-writable by default (no root required):
//! - Socket: `$XDG_RUNTIME_DIR/rollcalld/rollcalld.sock` or `/tmp/rollcalld-$USER/rollcalld.sock`
//! - Config: `$XDG_CONFIG_HOME/rollcall/config.toml` or `~/.config/rollcall/config.toml`
//! - Data: `$XDG_DATA_HOME/rollcalld` or `~/.local/share/rollcalld`
//! - Logs: `$XDG_STATE_HOME/rollcalld` or `~/.local/state/rollcalld`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const ROLLCALL_SOCKET_ENV: &str = "ROLLCALL_SOCKET";

/// Environment variable for overriding the data directory
pub const ROLLCALL_DATA_DIR_ENV: &str = "ROLLCALL_DATA_DIR";

const SOCKET_FILENAME: &str = "rollcalld.sock";
const APP_DIR: &str = "rollcalld";
const CONFIG_DIR: &str = "rollcall";

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$ROLLCALL_SOCKET` environment variable (if set)
/// 2. `$XDG_RUNTIME_DIR/rollcalld/rollcalld.sock` (if XDG_RUNTIME_DIR is set)
/// 3. `/tmp/rollcalld-$USER/rollcalld.sock` (fallback)
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(ROLLCALL_SOCKET_ENV) {
        return PathBuf::from(path);
    }
    socket_path_without_env()
}

/// Get the socket path without checking the ROLLCALL_SOCKET env var.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(CONFIG_DIR).join("config.toml");
    }
    match home_dir() {
        Some(home) => home.join(".config").join(CONFIG_DIR).join("config.toml"),
        None => PathBuf::from("/etc").join(CONFIG_DIR).join("config.toml"),
    }
}

/// Get the default data directory (holds the SQLite database).
///
/// Order of precedence:
/// 1. `$ROLLCALL_DATA_DIR` environment variable (if set)
/// 2. `$XDG_DATA_HOME/rollcalld` (if XDG_DATA_HOME is set)
/// 3. `~/.local/share/rollcalld` (fallback)
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(ROLLCALL_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }
    data_dir_without_env()
}

/// Get the data directory without checking the ROLLCALL_DATA_DIR env var.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }
    match home_dir() {
        Some(home) => home.join(".local").join("share").join(APP_DIR),
        None => PathBuf::from("/tmp").join(APP_DIR).join("data"),
    }
}

/// Get the default log directory.
pub fn default_log_dir() -> PathBuf {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME") {
        return PathBuf::from(state_home).join(APP_DIR);
    }
    match home_dir() {
        Some(home) => home.join(".local").join("state").join(APP_DIR),
        None => PathBuf::from("/tmp").join(APP_DIR).join("logs"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_contains_app_dir() {
        let path = socket_path_without_env();
        assert!(path.to_string_lossy().contains("rollcalld"));
        assert!(path.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn config_path_is_toml() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("rollcall"));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
    }

    #[test]
    fn data_and_log_dirs_contain_app_dir() {
        assert!(data_dir_without_env().to_string_lossy().contains("rollcalld"));
        assert!(default_log_dir().to_string_lossy().contains("rollcalld"));
    }
}
