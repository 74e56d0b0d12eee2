use std::fmt;

use thiserror::Error;

/// Failure of an HTTP exchange with a non-200 status.
///
/// The three statuses the RPC server is known to answer with get their own
/// variant; everything else keeps the status code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpStatusError {
    /// 401
    Unauthorized,
    /// 404
    NotFound,
    /// 500, the transient overload class
    InternalServerError,
    /// Any other non-200 status
    Other { status: u16, reason: String },
}

impl HttpStatusError {
    /// Maps a status code and its reason phrase to the error class.
    pub fn from_status(status: u16, reason: &str) -> Self {
        match status {
            401 => HttpStatusError::Unauthorized,
            404 => HttpStatusError::NotFound,
            500 => HttpStatusError::InternalServerError,
            status => HttpStatusError::Other {
                status,
                reason: reason.to_string(),
            },
        }
    }

    /// The numeric status this error was built from.
    pub fn status(&self) -> u16 {
        match self {
            HttpStatusError::Unauthorized => 401,
            HttpStatusError::NotFound => 404,
            HttpStatusError::InternalServerError => 500,
            HttpStatusError::Other { status, .. } => *status,
        }
    }
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpStatusError::Unauthorized => write!(f, "Unauthorized"),
            HttpStatusError::NotFound => write!(f, "Not found"),
            HttpStatusError::InternalServerError => write!(f, "Internal server error"),
            HttpStatusError::Other { reason, .. } => write!(f, "\"{}\" is not OK.", reason),
        }
    }
}

/// Known remote error codes.
///
/// Covers the JSON-RPC 2.0 reserved codes and the bitcoind-specific codes the
/// facade inspects. Codes not listed map to [`RemoteErrorKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Misc,
    Type,
    InvalidAddressOrKey,
    InvalidParameter,
    Verify,
    VerifyRejected,
    AlreadyInChain,
    InWarmup,
    Other,
}

/// Code to kind mapping table.
const REMOTE_ERROR_KINDS: &[(i64, RemoteErrorKind)] = &[
    (-32700, RemoteErrorKind::ParseError),
    (-32600, RemoteErrorKind::InvalidRequest),
    (-32601, RemoteErrorKind::MethodNotFound),
    (-32602, RemoteErrorKind::InvalidParams),
    (-32603, RemoteErrorKind::InternalError),
    (-1, RemoteErrorKind::Misc),
    (-3, RemoteErrorKind::Type),
    (-5, RemoteErrorKind::InvalidAddressOrKey),
    (-8, RemoteErrorKind::InvalidParameter),
    (-25, RemoteErrorKind::Verify),
    (-26, RemoteErrorKind::VerifyRejected),
    (-27, RemoteErrorKind::AlreadyInChain),
    (-28, RemoteErrorKind::InWarmup),
];

impl RemoteErrorKind {
    pub fn from_code(code: i64) -> Self {
        REMOTE_ERROR_KINDS
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, kind)| *kind)
            .unwrap_or(RemoteErrorKind::Other)
    }
}

/// Every failure a call can end with.
///
/// The type is `Clone` because a batch-level failure is delivered to every
/// caller in the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoinrpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout error after {0}ms")]
    Timeout(u64),

    #[error("{0}")]
    HttpStatus(HttpStatusError),

    #[error("Malformed response: {0}")]
    Protocol(String),

    #[error("Missing RPC result")]
    MissingResult,

    #[error("{message}")]
    Remote { code: i64, message: String },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: usize,
        last: Box<CoinrpcError>,
    },

    #[error("JSON serialization error: {0}")]
    Serialization(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scheduler is no longer running")]
    SchedulerClosed,

    #[error("Block mismatch: {0}")]
    BlockMismatch(String),
}

impl CoinrpcError {
    /// Whether the dispatcher should resend the batch after this error.
    ///
    /// Only the transient overload class is retried. Connection failures,
    /// timeouts and every other status propagate to the callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoinrpcError::HttpStatus(HttpStatusError::InternalServerError)
        )
    }

    /// Whether this error fails the whole batch rather than a single call.
    pub fn is_batch_level(&self) -> bool {
        !matches!(
            self,
            CoinrpcError::Remote { .. } | CoinrpcError::MissingResult
        )
    }

    /// The remote error code, if the server reported one.
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            CoinrpcError::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        self.remote_code().map(RemoteErrorKind::from_code)
    }
}

impl From<serde_json::Error> for CoinrpcError {
    fn from(err: serde_json::Error) -> Self {
        CoinrpcError::Serialization(err.to_string())
    }
}

impl From<HttpStatusError> for CoinrpcError {
    fn from(err: HttpStatusError) -> Self {
        CoinrpcError::HttpStatus(err)
    }
}

pub type Result<T> = std::result::Result<T, CoinrpcError>;
