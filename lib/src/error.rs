//! Error taxonomy for the daemon core.
//!
//! Mirrors the propagation policy in the design doc: [`DaemonError`] carries
//! the kinds that call sites need to match on (a protocol error stays on its
//! session, an archive error flips the state machine to `boot_failed`, and so
//! on); everything else threads through as `anyhow::Error` with context.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// The seven error kinds from the error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Malformed address, invalid port, or missing required argument.
    /// Reported at startup; the process exits.
    #[error("configuration error: {0}")]
    Config(String),

    /// Profile store read/write failure. Degrades to in-memory defaults;
    /// logged, never fatal.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Unreadable or corrupt ROM archive.
    #[error("archive error: {0}")]
    Archive(String),

    /// Launcher not executable, spawn failure, boot timeout, or premature
    /// exit.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// Unparseable JSON or unknown request type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket I/O failure. Terminates the affected session only.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Input device unavailable; the event is dropped.
    #[error("input error: {0}")]
    Input(String),
}
