//! Server configuration file.
//!
//! ```yaml
//! dir: /srv/data
//! address: 0.0.0.0:8049
//! auth:
//!   enabled: true
//!   allow_cidrs: ["10.0.0.0/8"]
//! ```
//!
//! Environment variables (`$VAR` or `${VAR}`) are expanded before parsing.
//! YAML is tried first, then JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServerError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_cidrs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory to export.
    pub dir: PathBuf,
    /// `host:port` the NFS listener binds to.
    pub address: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl ServerConfig {
    pub fn new(dir: impl Into<PathBuf>, address: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            address: address.into(),
            auth: AuthConfig::default(),
        }
    }

    /// Loads configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("failed to read {}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded server config");
        Self::parse(&content)
    }

    /// Parses configuration text, expanding environment variables first.
    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let expanded = expand_env(content);
        match serde_yaml::from_str(&expanded) {
            Ok(config) => Ok(config),
            Err(yaml_err) => serde_json::from_str(&expanded).map_err(|json_err| {
                ServerError::Config(format!(
                    "invalid config (yaml: {yaml_err}; json: {json_err})"
                ))
            }),
        }
    }
}

/// Expands `$VAR` and `${VAR}` from the process environment. Unset
/// variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    expand_env_with(input, |name| std::env::var(name).ok())
}

/// Like [`expand_env`], resolving names through `lookup`.
pub fn expand_env_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
            // Unterminated brace, keep literally
            out.push('$');
            rest = after;
            continue;
        }

        let name_len = after
            .char_indices()
            .find(|&(i, c)| {
                !(c == '_' || c.is_ascii_alphanumeric()) || (i == 0 && c.is_ascii_digit())
            })
            .map_or(after.len(), |(i, _)| i);
        if name_len == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&lookup(&after[..name_len]).unwrap_or_default());
        rest = &after[name_len..];
    }
    out.push_str(rest);
    out
}
