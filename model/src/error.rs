use std::fmt;

/// The error taxonomy shared across every MetaStore crate (SPEC_FULL.md §7).
///
/// Names are deliberately close to the etcd v3 status taxonomy so that an
/// (out-of-scope) gRPC gateway can map each variant to a status code without
/// re-deriving the mapping.
#[derive(Debug, Clone)]
pub enum Error {
    KeyNotFound,
    Compacted { requested: u64, floor: u64 },
    FutureRev { requested: u64, current: u64 },
    LeaseNotFound,
    LeaseExists,
    LeaseExpired,
    WatchCanceled,
    ResourceExhausted(String),
    Cancelled,
    InvalidArgument(String),
    FailedPrecondition(String),
    /// A Raft Storage read (`term`, `entries`) asked for an index beyond
    /// what's been appended yet (SPEC_FULL.md §4.5).
    Unavailable(String),
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found"),
            Error::Compacted { requested, floor } => write!(
                f,
                "requested revision {} is below the compaction floor {}",
                requested, floor
            ),
            Error::FutureRev { requested, current } => write!(
                f,
                "requested revision {} is beyond current revision {}",
                requested, current
            ),
            Error::LeaseNotFound => write!(f, "lease not found"),
            Error::LeaseExists => write!(f, "lease already exists"),
            Error::LeaseExpired => write!(f, "lease expired"),
            Error::WatchCanceled => write!(f, "watch canceled"),
            Error::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::FailedPrecondition(msg) => write!(f, "failed precondition: {}", msg),
            Error::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(e.to_string())
    }
}

/// Result alias used throughout the library crates instead of bare
/// `anyhow::Result`.
pub type CResult<T> = Result<T, Error>;
