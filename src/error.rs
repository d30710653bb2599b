use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced by the registry's public operations.
///
/// Failures inside a running controller never raise; they land in the
/// target's error buffer and, where asynchronous, on the notification
/// bus. Marshalled debug primitives report failure through their own
/// return value and errno, as the debugger library expects.
#[derive(Debug, Error)]
pub enum ProcError {
    /// The victim could not be created or grabbed, or died before the
    /// first rendezvous. Carries the controller's error-buffer text.
    #[error("no such process: {0}")]
    NoSuchProcess(String),

    /// The marshalling pipe could not be set up.
    #[error("failed to create marshalling pipe: {0:?}")]
    Pipe(Errno),

    /// The control thread could not be spawned.
    #[error("failed to create control thread: {0}")]
    Thread(std::io::Error),

    /// Malformed configuration input.
    #[error("bad configuration: {0}")]
    Config(#[source] serde_json::Error),
}
