//! Bearer tokens for the tunnel.

use std::fmt;

use subtle::ConstantTimeEq;
use tokio::process::Command;
use tracing::debug;

use crate::error::TunnelError;

/// Where the client gets its token from.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClientAuth {
    /// Literal token. Takes precedence when non-empty.
    pub token: Option<String>,
    /// Shell command whose trimmed stdout is the token.
    pub token_cmd: Option<String>,
}

impl fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAuth")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_cmd", &self.token_cmd)
            .finish()
    }
}

impl ClientAuth {
    pub fn new(token: Option<String>, token_cmd: Option<String>) -> Self {
        Self { token, token_cmd }
    }

    /// Resolves the token, running `token_cmd` through `sh -c` if needed.
    /// `Ok(None)` means no credential is configured.
    pub async fn resolve(&self) -> Result<Option<String>, TunnelError> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            return validate(token.to_string()).map(Some);
        }
        let Some(cmd) = self.token_cmd.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(None);
        };

        debug!(command = cmd, "Running token command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(|e| TunnelError::Auth(format!("failed to run token command: {e}")))?;
        if !output.status.success() {
            return Err(TunnelError::Auth(format!(
                "token command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(TunnelError::Auth("token command produced no output".to_string()));
        }
        validate(token).map(Some)
    }
}

/// Tokens may not span lines; the preamble is newline-terminated.
fn validate(token: String) -> Result<String, TunnelError> {
    if token.contains(['\n', '\r']) {
        return Err(TunnelError::Auth("token must be a single line".to_string()));
    }
    Ok(token)
}

/// Tokens the server accepts.
#[derive(Clone, Default)]
pub struct TokenSet {
    tokens: Vec<String>,
}

impl TokenSet {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    /// Whether clients must present a token.
    pub fn is_required(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Constant-time comparison against every accepted token.
    pub fn verify(&self, presented: &str) -> bool {
        let mut matched = subtle::Choice::from(0u8);
        for token in &self.tokens {
            matched |= token.as_bytes().ct_eq(presented.as_bytes());
        }
        matched.into()
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("count", &self.tokens.len())
            .finish()
    }
}
