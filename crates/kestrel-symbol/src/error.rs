/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error from the [wholesym] crate.
    #[error(transparent)]
    Wholesym(#[from] wholesym::Error),

    /// File open error.
    #[error("{}: {}", .0.display(), .1)]
    File(std::path::PathBuf, std::io::Error),

    /// Error from the [goblin] crate.
    #[error(transparent)]
    Goblin(#[from] goblin::error::Error),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;

impl From<Error> for kestrel_target::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::File(_, e) => Self::Io(e),
            e => Self::Internal(e.to_string()),
        }
    }
}
