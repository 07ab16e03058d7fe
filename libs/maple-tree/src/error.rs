use thiserror::Error;

/// Errors returned by tree operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The requested range is inverted, the stored value collides with an
    /// internal sentinel, or an allocation-mode operation was attempted on a
    /// tree without gap tracking.
    #[error("invalid argument")]
    InvalidArgument,
    /// `insert_range` found an existing entry inside the requested range.
    #[error("range already occupied")]
    AlreadyExists,
    /// A node allocation failed and the operation was rolled back.
    #[error("out of memory")]
    OutOfMemory,
    /// No gap of the requested size exists inside the requested window.
    #[error("no fit found")]
    Busy,
}

impl Error {
    /// Stable small integer used when an error travels through a walker's
    /// node word as an encoded sentinel.
    pub(crate) const fn code(self) -> usize {
        match self {
            Error::InvalidArgument => 1,
            Error::AlreadyExists => 2,
            Error::OutOfMemory => 3,
            Error::Busy => 4,
        }
    }

    pub(crate) const fn from_code(code: usize) -> Option<Self> {
        match code {
            1 => Some(Error::InvalidArgument),
            2 => Some(Error::AlreadyExists),
            3 => Some(Error::OutOfMemory),
            4 => Some(Error::Busy),
            _ => None,
        }
    }
}
