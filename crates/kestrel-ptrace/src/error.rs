use nix::errno::Errno;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// File open/read error.
    #[error("{}: {}", .0.display(), .1)]
    File(std::path::PathBuf, std::io::Error),

    /// System call failure.
    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    /// Every task vanished during the attach.
    #[error("no thread of process {0} could be attached")]
    NoThread(u64),

    #[error("no stopped thread to access memory through")]
    NoStoppedThread,

    /// The operation needs a ptrace-stopped task.
    #[error("thread {0} is not stopped")]
    NotStopped(u64),

    /// Register block not exposed by this backend.
    #[error("{0:?} registers not supported")]
    Unsupported(kestrel_target::StateKind),

    /// Partial memory transfer.
    #[error("memory read/write {0} bytes instead of {1}")]
    PartialMemOp(usize, usize),

    /// Unreadable `/proc` listing.
    #[error(transparent)]
    Lines(#[from] tokio_util::codec::LinesCodecError),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;

impl From<Error> for kestrel_target::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) | Error::File(_, e) => Self::Io(e),
            Error::Os(Errno::ESRCH) | Error::NotStopped(_) | Error::NoStoppedThread => {
                Self::BadState
            }
            Error::Os(Errno::EINVAL) => Self::InvalidArgs,
            Error::Os(errno) => Self::Io(std::io::Error::from(errno)),
            Error::Unsupported(_) => Self::NotSupported,
            Error::PartialMemOp(actual, expected) => Self::PartialTransfer { actual, expected },
            e => Self::Internal(e.to_string()),
        }
    }
}
