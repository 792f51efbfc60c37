use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// Socket setup or accept failure.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Credential could not be obtained or was rejected.
    #[error("authentication error: {0}")]
    Auth(String),

    /// The metrics exporter could not be installed.
    #[error("metrics exporter: {0}")]
    Metrics(String),
}

impl TunnelError {
    pub(crate) fn transport(context: impl Into<String>, source: io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}
