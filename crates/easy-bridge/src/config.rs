//! Bridge configuration file
//!
//! The file uses the common `mcpServers` layout:
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "github": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-github"] },
//!     "remote": { "url": "https://mcp.example.com" }
//!   }
//! }
//! ```

use easy_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name looked up in the working directory and its ancestors
pub const BRIDGE_CONFIG_FILE: &str = "mcp-bridge.json";

/// Prefix of per-provider variables: `EASY_MCP_SERVER.<provider>.<key>`
pub const PROVIDER_ENV_PREFIX: &str = "EASY_MCP_SERVER.";

/// Package name a project manifest must depend on for ancestor lookup
const PACKAGE_NAME: &str = "easy-mcp-server";

const DEPENDENCY_SECTIONS: &[&str] = &["dependencies", "devDependencies", "peerDependencies"];

/// Parsed bridge configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, BridgeServerConfig>,
}

/// One provider entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeServerConfig {
    /// Executable for a process bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Static environment for the child process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the child process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Base URL of an HTTP bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extra headers sent to an HTTP bridge
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub disabled: bool,
}

/// How a provider entry is reached
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEndpoint<'a> {
    Process { command: &'a str, args: &'a [String] },
    Http { url: &'a str },
}

impl BridgeServerConfig {
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: Some(command.into()),
            args,
            ..Default::default()
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// An entry with `url` is an HTTP bridge, otherwise `command` is required
    pub fn endpoint(&self) -> Option<BridgeEndpoint<'_>> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(BridgeEndpoint::Http { url });
        }
        self.command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(|command| BridgeEndpoint::Process {
                command,
                args: &self.args,
            })
    }
}

impl BridgeConfig {
    /// Load configuration from a JSON file. A missing file is an empty
    /// configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Bridge config not found");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = Self::parse(&content).map_err(|e| {
            Error::config(format!("invalid bridge config {}: {}", path.display(), e))
        })?;
        info!(
            path = %path.display(),
            servers = config.mcp_servers.len(),
            "Loaded bridge config"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> serde_json::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(content)
    }

    /// Enabled entries in name order, skipping unusable ones with a warning
    pub fn enabled(&self) -> impl Iterator<Item = (&str, &BridgeServerConfig)> {
        self.mcp_servers.iter().filter_map(|(name, server)| {
            if server.disabled {
                debug!(bridge = %name, "Bridge disabled in config");
                return None;
            }
            if server.endpoint().is_none() {
                warn!(bridge = %name, "Bridge entry has neither 'command' nor 'url', skipping");
                return None;
            }
            Some((name.as_str(), server))
        })
    }
}

/// Locate the bridge configuration file.
///
/// Order: explicit override (absolute, or relative to `cwd`) →
/// `cwd/mcp-bridge.json` → nearest ancestor whose `package.json` depends on
/// easy-mcp-server and that holds `mcp-bridge.json` → None.
pub fn resolve_config_path(override_path: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
    if let Some(path) = override_path {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        return Some(path);
    }

    let local = cwd.join(BRIDGE_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }

    for dir in cwd.ancestors().skip(1) {
        let manifest = dir.join("package.json");
        if !manifest.is_file() {
            continue;
        }
        if !declares_dependency(&manifest) {
            continue;
        }
        let candidate = dir.join(BRIDGE_CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        // The nearest project root wins even without a config
        debug!(manifest = %manifest.display(), "Project root has no bridge config");
        return None;
    }

    None
}

fn declares_dependency(manifest: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(manifest) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(&content) else {
        return false;
    };
    DEPENDENCY_SECTIONS.iter().any(|section| {
        value
            .get(*section)
            .and_then(Value::as_object)
            .map(|deps| deps.contains_key(PACKAGE_NAME))
            .unwrap_or(false)
    })
}

/// Per-provider variables from `EASY_MCP_SERVER.<provider>.<key>` entries.
///
/// The provider segment is matched case-insensitively; the key is upper-cased
/// with `-` and `.` turned into `_`.
pub fn provider_env<I>(vars: I, provider: &str) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let provider = provider.to_lowercase();
    let mut env = BTreeMap::new();

    for (name, value) in vars {
        let Some(rest) = name.strip_prefix(PROVIDER_ENV_PREFIX) else {
            continue;
        };
        let Some((var_provider, key)) = rest.split_once('.') else {
            continue;
        };
        if var_provider.to_lowercase() != provider || key.is_empty() {
            continue;
        }
        let key = key.to_uppercase().replace(['-', '.'], "_");
        env.insert(key, value);
    }

    env
}

/// Full environment overlay for one provider: static `env` entries from the
/// config file, overridden by provider variables.
pub fn bridge_env<I>(server: &BridgeServerConfig, provider: &str, vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env = server.env.clone();
    env.extend(provider_env(vars, provider));
    env
}
