/// Core types and error taxonomy for the docgate system
use thiserror::Error;

/// Identifier for one child process and its jail directory.
/// Always nonzero and odd; zero is reserved for "not a child".
pub type ChildId = u64;

/// Process exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code for a command-line usage error.
pub const EXIT_USAGE: i32 = 64;
/// Process exit code for an unresolvable startup failure.
pub const EXIT_UNAVAILABLE: i32 = 69;

/// Custom error types for docgate
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Jail error: {0}")]
    Jail(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Document kit error: {0}")]
    Kit(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<nix::errno::Errno> for GatewayError {
    fn from(err: nix::errno::Errno) -> Self {
        GatewayError::Process(err.to_string())
    }
}

/// Result type alias for docgate operations
pub type Result<T> = std::result::Result<T, GatewayError>;
