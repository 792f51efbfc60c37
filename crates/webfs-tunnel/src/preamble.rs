//! Connection preamble carrying the bearer token.
//!
//! The first bytes of an authenticated connection are
//! `WEBFS-AUTH <token>\n`; everything after the newline is tunneled payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

pub const PREAMBLE_PREFIX: &str = "WEBFS-AUTH ";

/// Longest preamble accepted, newline included.
pub const MAX_PREAMBLE_LEN: usize = 4096;

pub fn encode(token: &str) -> Vec<u8> {
    format!("{PREAMBLE_PREFIX}{token}\n").into_bytes()
}

pub async fn write_preamble<W>(writer: &mut W, token: &str) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&encode(token))
        .await
        .map_err(|e| TunnelError::transport("failed to send auth preamble", e))
}

/// Reads the preamble and returns the presented token.
///
/// Reads one byte at a time so nothing past the newline is consumed.
pub async fn read_preamble<R>(reader: &mut R) -> Result<String, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| TunnelError::transport("failed to read auth preamble", e))?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() >= MAX_PREAMBLE_LEN {
            return Err(TunnelError::Auth("preamble too long".to_string()));
        }
    }

    let line = String::from_utf8(line)
        .map_err(|_| TunnelError::Auth("preamble is not UTF-8".to_string()))?;
    line.strip_prefix(PREAMBLE_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| TunnelError::Auth("missing auth preamble".to_string()))
}
