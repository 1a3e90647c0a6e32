use faststr::FastStr;
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Whether an error is worth another attempt with a fresh connection.
///
/// Drives the managed transaction loop: retryable errors disconnect the
/// session and go around again, everything else surfaces immediately.
pub trait Retryable {
    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// The server or network is unreachable. Always safe to retry against
    /// another cluster member.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The session's view of the cluster is outdated, e.g. the member it was
    /// routed to no longer fills that role.
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("no read service currently available")]
    ReadServiceUnavailable,

    #[error("no write service currently available")]
    WriteServiceUnavailable,

    /// The pool condition wait ran out of budget before a slot freed up.
    #[error("failed to obtain a connection from the pool within {0}s (timeout)")]
    AcquisitionTimeout(f64),

    /// The routing refresh lock could not be taken within the deadline.
    #[error("pool failed to update routing table within {0}s (timeout)")]
    RoutingRefreshTimeout(f64),

    /// Socket I/O outlived the deadline attached to its connection.
    #[error("socket deadline exceeded")]
    DeadlineExceeded,

    /// Client misuse: empty query, invalid timeout, explicit transaction
    /// already open, and friends. Never retried.
    #[error("{0}")]
    Client(String),

    /// Invalid driver configuration, surfaced unchanged.
    #[error("{0}")]
    Config(String),

    /// A failure reported by the server, with its vendor status code.
    #[error("server error [{}] {}", .0.code, .0.message)]
    Server(ServerError),
}

impl Error {
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Error::ServiceUnavailable(message.into())
    }

    pub fn session_expired(message: impl Into<String>) -> Self {
        Error::SessionExpired(message.into())
    }

    pub fn client(message: impl Into<String>) -> Self {
        Error::Client(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable()
    }

    /// True for errors meaning "this member can't serve me right now", which
    /// the routing pool answers by deactivating the address and moving on.
    pub(crate) fn rotates_address(&self) -> bool {
        matches!(
            self,
            Error::ServiceUnavailable(_) | Error::SessionExpired(_) | Error::DeadlineExceeded
        )
    }
}

impl Retryable for Error {
    fn retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable(_) | Error::SessionExpired(_) => true,
            // The transaction clock, not the socket budget, decides when to
            // stop retrying.
            Error::DeadlineExceeded => true,
            Error::Server(e) => e.retryable(),
            _ => false,
        }
    }
}

/// An error status received from the server, `code` being the vendor status
/// string (e.g. `Neo.TransientError.General.TransactionMemoryLimit`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: FastStr,
    pub message: FastStr,
}

impl ServerError {
    pub fn new(code: impl Into<FastStr>, message: impl Into<FastStr>) -> Self {
        ServerError {
            code: code.into(),
            message: message.into(),
        }
    }

    fn classification(&self) -> &str {
        self.code.split('.').nth(1).unwrap_or("")
    }

    pub fn is_transient(&self) -> bool {
        self.classification() == "TransientError"
            // Superseded codes the server may still emit; both mean the client
            // gave up on the transaction, not that it should run again.
            && self.code != "Neo.TransientError.Transaction.Terminated"
            && self.code != "Neo.TransientError.Transaction.LockClientStopped"
    }

    /// Writer-side errors that merely mean "not this member": the routing
    /// table's writer entry is dropped and the work retried elsewhere.
    pub fn invalidates_writer(&self) -> bool {
        self.code == "Neo.ClientError.Cluster.NotALeader"
            || self.code == "Neo.ClientError.General.ForbiddenOnReadOnlyDatabase"
    }

    /// A failure of the routing request itself. Asking another router cannot
    /// help, so rediscovery aborts immediately.
    pub fn is_fatal_during_discovery(&self) -> bool {
        if self.code == "Neo.ClientError.Database.DatabaseNotFound"
            || self.code == "Neo.ClientError.Transaction.InvalidBookmark"
            || self.code == "Neo.ClientError.Transaction.InvalidBookmarkMixture"
            || self.code == "Neo.ClientError.Statement.TypeError"
            || self.code == "Neo.ClientError.Statement.ArgumentError"
            || self.code == "Neo.ClientError.Request.Invalid"
        {
            return true;
        }
        self.code.starts_with("Neo.ClientError.Security.")
            && self.code != "Neo.ClientError.Security.AuthorizationExpired"
    }
}

impl Retryable for ServerError {
    fn retryable(&self) -> bool {
        self.is_transient()
            || self.invalidates_writer()
            || self.code == "Neo.ClientError.Security.AuthorizationExpired"
    }
}

impl From<ServerError> for Error {
    fn from(e: ServerError) -> Self {
        Error::Server(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ServiceUnavailable(e.to_string())
    }
}
