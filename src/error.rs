use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error")]
    Io(#[from] io::Error),

    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate values are not allowed on tree `{0}`")]
    DuplicateValueNotAllowed(String),

    #[error("a tree named `{0}` is already managed")]
    AlreadyManaged(String),

    #[error("invalid cursor operation: {0}")]
    Cursor(&'static str),

    #[error("read past the end of the file at offset {0:#x}")]
    EndOfFile(u64),

    #[error("corrupt file: {0}")]
    CorruptFile(String),

    #[error("page offset {0:#x} is out of range")]
    OutOfRange(u64),

    #[error("revision {0} is unknown or has been reclaimed")]
    RevisionUnavailable(u64),
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptFile(msg.into())
    }
}
