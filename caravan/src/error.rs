use std::io;

use thiserror::Error;

/// Errors returned by target setup and teardown.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup or teardown failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Listener socket setup failed.
    #[error("listener setup: {0}")]
    ListenerSetup(String),
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
    /// System resource limit too low.
    #[error("{0}")]
    ResourceLimit(String),
}
