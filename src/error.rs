use crate::common::*;
use thiserror::Error;

/// The error half of a [deferred](crate::Deferred) resolution.
///
/// Closed sinks and drained sources are signals carried in result enums, not
/// errors. The variants here cover the cases where a deferred can no longer
/// produce its value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The deferred was still pending when its timeout fired.
    #[error("deferred timed out")]
    Timeout,

    /// Every producer of the deferred was dropped before resolving it.
    #[error("deferred abandoned before resolution")]
    Abandoned,

    /// A user callback failed.
    #[error("{0}")]
    Failure(Arc<str>),
}

impl Error {
    /// Wraps any displayable failure raised by user code.
    pub fn failure(err: impl Display) -> Self {
        Self::Failure(err.to_string().into())
    }
}
