/// Error type shared by the engine and the target primitives it drives.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An equivalent installation already occupies the address or slot.
    #[error("already bound")]
    AlreadyBound,

    /// The hardware slot table is exhausted.
    #[error("no resources")]
    NoResources,

    /// Nothing of the requested kind is installed at this address.
    #[error("out of range")]
    OutOfRange,

    /// The object is not in a state allowing the operation (e.g., a running
    /// thread, or a missing process).
    #[error("bad state")]
    BadState,

    /// The referenced object does not exist.
    #[error("not found")]
    NotFound,

    /// The request itself is malformed.
    #[error("invalid arguments")]
    InvalidArgs,

    /// The operation is not supported on this target.
    #[error("not supported")]
    NotSupported,

    /// A memory transfer did not complete.
    #[error("memory transfer of {actual} bytes instead of {expected}")]
    PartialTransfer {
        /// Number of bytes actually transferred.
        actual: usize,

        /// Number of bytes requested.
        expected: usize,
    },

    /// Underlying OS call failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure outside this engine's control, with a description.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
