//! Error handling utils.
//!
//! Kernel-facing failures (`epoll_ctl`, `pipe`, `fstat`, the socket calls)
//! surface as [`Error::Io`] and are logged at the call site. Broken runtime
//! invariants (double event registration, resuming a running fiber, a failed
//! context switch) are process-fatal assertions, not `Err` values: they
//! indicate a bug in the caller or the runtime, never a recoverable
//! condition.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("config value `{key}` has unexpected shape: {detail}")]
    ConfigValue { key: String, detail: String },

    /// This should only be used if the error doesn't fall into one of the
    /// above categories.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    #[inline(always)]
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}
