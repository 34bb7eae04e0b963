//! Crate-level error surface.
//!
//! A thin wrapper over the canonical per-capability errors; the only
//! cross-cutting notion is whether a retry can help, which drives the
//! cloud backoff policy.

use thiserror::Error;

use crate::auth::AuthError;
use crate::cloud::CloudError;
use crate::component::DomainError;

/// Whether retrying an operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs or state.
    Permanent,
    /// Retry may help (transient outage or contention).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Domain(err) => err.transience(),
            Error::Auth(err) => err.transience(),
            Error::Cloud(err) => err.transience(),
        }
    }
}
