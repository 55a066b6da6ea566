//! Environment and settings loading
//!
//! Two layers:
//!
//! * [`load_environment`] copies `KEY=VALUE` lines from an env file into the
//!   process environment. This is how provider variables such as
//!   `EASY_MCP_SERVER.github.token` (not exportable from most shells) usually
//!   reach the bridge subsystem.
//! * [`Settings`] is assembled with the `config` crate: defaults, then an
//!   optional `easy-mcp-server.toml`, then `EASY_MCP_SERVER_*` variables.
//!   CLI flags are applied on top by the binary.
//!
//! ```no_run
//! use easy_core::config::{load_environment, Settings};
//!
//! load_environment();
//! let settings = Settings::load(None).unwrap();
//! println!("listening on {:?}", settings.http_addr);
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Variable naming an explicit env file
pub const ENV_FILE_VAR: &str = "EASY_MCP_SERVER_ENV_FILE";

/// Env file looked up in the working directory
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Settings file looked up in the working directory
pub const DEFAULT_SETTINGS_FILE: &str = "easy-mcp-server.toml";

/// Prefix of settings environment variables (`EASY_MCP_SERVER_HTTP_ADDR`, ...)
pub const ENV_PREFIX: &str = "EASY_MCP_SERVER";

/// Load environment variables from the env file.
///
/// Uses `$EASY_MCP_SERVER_ENV_FILE` when set, otherwise `.env` in the working
/// directory. Variables that are already set are left alone.
///
/// Returns the path that was loaded, or None if no file was found.
pub fn load_environment() -> Option<PathBuf> {
    if let Ok(custom_path) = std::env::var(ENV_FILE_VAR) {
        if let Some(path) = try_load_env_file(Path::new(&custom_path)) {
            return Some(path);
        }
        warn!(path = %custom_path, "{} points at an unreadable file", ENV_FILE_VAR);
    }

    if let Some(path) = try_load_env_file(Path::new(DEFAULT_ENV_FILE)) {
        return Some(path);
    }

    debug!("No environment file found, using existing environment");
    None
}

fn try_load_env_file(path: &Path) -> Option<PathBuf> {
    if !path.is_file() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => {
            let mut loaded = 0;
            let mut skipped = 0;

            for (key, value) in content.lines().filter_map(parse_env_line) {
                if std::env::var_os(&key).is_some() {
                    skipped += 1;
                    debug!("Skipped (already set): {}", key);
                    continue;
                }
                std::env::set_var(&key, &value);
                loaded += 1;
                debug!(
                    "Loaded: {}={}",
                    key,
                    if is_secret(&key) { "***" } else { value.as_str() }
                );
            }

            info!(
                "Loaded {} environment variables from {} ({} skipped - already set)",
                loaded,
                path.display(),
                skipped
            );
            Some(path.to_path_buf())
        }
        Err(e) => {
            warn!("Failed to read environment file {}: {}", path.display(), e);
            None
        }
    }
}

fn is_secret(key: &str) -> bool {
    let upper = key.to_uppercase();
    ["KEY", "TOKEN", "SECRET", "PASSWORD"]
        .iter()
        .any(|marker| upper.contains(marker))
}

/// Parse a single env line. Handles `KEY=VALUE`, quoted values and an
/// optional `export ` prefix; comments and blank lines yield None.
pub fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);

    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return None;
    }

    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Runtime settings of the server
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server name reported in `initialize`
    pub name: String,
    /// Listen address of the HTTP transport
    pub http_addr: Option<String>,
    pub ws_addr: Option<String>,
    pub sse_addr: Option<String>,
    /// Serve on stdin/stdout
    pub stdio: bool,
    pub log_level: String,
    /// Attach cause chain, backtrace and request context to error responses
    pub detailed_errors: bool,
    pub bridge_config_path: Option<PathBuf>,
    pub bridges_enabled: bool,
    pub prompts_dir: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub bridge_call_timeout_ms: u64,
    pub bridge_list_timeout_ms: u64,
    pub bridge_init_timeout_ms: u64,
    /// Wait after spawning bridges before they are considered usable
    pub bridge_grace_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: "easy-mcp-server".to_string(),
            http_addr: Some("127.0.0.1:8888".to_string()),
            ws_addr: None,
            sse_addr: None,
            stdio: false,
            log_level: "info".to_string(),
            detailed_errors: false,
            bridge_config_path: None,
            bridges_enabled: true,
            prompts_dir: None,
            resources_dir: None,
            bridge_call_timeout_ms: 10_000,
            bridge_list_timeout_ms: 10_000,
            bridge_init_timeout_ms: 30_000,
            bridge_grace_ms: 500,
        }
    }
}

impl Settings {
    /// Load settings from defaults, the settings file and the process
    /// environment.
    ///
    /// An explicit `path` must exist; the default `easy-mcp-server.toml` is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`Settings::load`], reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::new(DEFAULT_SETTINGS_FILE, config::FileFormat::Toml)
                .required(false),
        };

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| Error::config(format!("failed to load settings: {}", e)))?;

        debug!(?settings, "Settings loaded");
        Ok(settings)
    }

    pub fn bridge_call_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_call_timeout_ms)
    }

    pub fn bridge_list_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_list_timeout_ms)
    }

    pub fn bridge_init_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_init_timeout_ms)
    }

    pub fn bridge_grace(&self) -> Duration {
        Duration::from_millis(self.bridge_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_env_line_simple() {
        let (k, v) = parse_env_line("FOO=bar").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_quoted_and_exported() {
        let (k, v) = parse_env_line("export FOO=\"bar baz\"").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar baz");

        let (_, v) = parse_env_line("FOO='bar'").unwrap();
        assert_eq!(v, "bar");
    }

    #[test]
    fn test_parse_env_line_keeps_dotted_provider_keys() {
        let (k, v) = parse_env_line("EASY_MCP_SERVER.github.token=abc=def").unwrap();
        assert_eq!(k, "EASY_MCP_SERVER.github.token");
        assert_eq!(v, "abc=def");
    }

    #[test]
    fn test_parse_env_line_skips_noise() {
        assert!(parse_env_line("").is_none());
        assert!(parse_env_line("   # comment").is_none());
        assert!(parse_env_line("=value").is_none());
        assert!(parse_env_line("NOEQUALS").is_none());
    }

    #[test]
    fn test_env_file_does_not_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "EASY_CORE_TEST_FRESH=loaded").unwrap();
        writeln!(file, "EASY_CORE_TEST_PRESET=from-file").unwrap();
        std::env::set_var("EASY_CORE_TEST_PRESET", "from-shell");

        let loaded = try_load_env_file(file.path());
        assert_eq!(loaded.as_deref(), Some(file.path()));
        assert_eq!(std::env::var("EASY_CORE_TEST_FRESH").unwrap(), "loaded");
        assert_eq!(std::env::var("EASY_CORE_TEST_PRESET").unwrap(), "from-shell");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::load_with_env(None, Some(HashMap::new())).unwrap();
        assert_eq!(settings.name, "easy-mcp-server");
        assert_eq!(settings.http_addr.as_deref(), Some("127.0.0.1:8888"));
        assert!(settings.bridges_enabled);
        assert_eq!(settings.bridge_call_timeout(), Duration::from_secs(10));
        assert_eq!(settings.bridge_init_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_settings_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "name = \"from-file\"\ndetailed_errors = true\nbridge_grace_ms = 50\n",
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("EASY_MCP_SERVER_NAME".to_string(), "from-env".to_string());
        env.insert(
            "EASY_MCP_SERVER_BRIDGE_CONFIG_PATH".to_string(),
            "/tmp/bridges.json".to_string(),
        );

        let settings = Settings::load_with_env(Some(&path), Some(env)).unwrap();
        assert_eq!(settings.name, "from-env");
        assert!(settings.detailed_errors);
        assert_eq!(settings.bridge_grace_ms, 50);
        assert_eq!(
            settings.bridge_config_path.as_deref(),
            Some(Path::new("/tmp/bridges.json"))
        );
    }

    #[test]
    fn test_settings_missing_explicit_file_fails() {
        let err = Settings::load_with_env(
            Some(Path::new("/nonexistent/easy-mcp-server.toml")),
            Some(HashMap::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
