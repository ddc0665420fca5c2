use std::fmt;

/// A basalt result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

/// A basalt error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A malformed or ill-timed peer message (missing header, wrong state,
    /// not subscribed, stale vote). The offending peer session is reset via
    /// reconnect; the state machine continues.
    Protocol(String),
    /// Divergent histories detected while synchronizing (forked log, or a
    /// requester ahead of the responder). Fatal to the synchronization
    /// attempt; the node returns to SEARCHING and reconnects the peer.
    Divergence(String),
    /// The engine requires a checkpoint before starting a new transaction.
    /// Transparently retried after wait_for_checkpoint().
    Checkpoint,
    /// The operation was aborted, e.g. by leader loss or shutdown.
    Abort,
    /// An unrecoverable internal fault, typically database corruption. The
    /// node halts rather than risk replica divergence.
    Internal(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Protocol(s) => write!(f, "protocol error: {s}"),
            Error::Divergence(s) => write!(f, "divergence: {s}"),
            Error::Checkpoint => write!(f, "checkpoint required"),
            Error::Abort => write!(f, "operation aborted"),
            Error::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl Error {
    /// Returns true if this error resets the offending peer session rather
    /// than halting the node.
    pub fn is_session_fault(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Divergence(_))
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Protocol(format!("invalid UTF-8 payload: {err}"))
    }
}
