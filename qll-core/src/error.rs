use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuillError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {offset}")]
    OffsetOutOfRange { offset: u64 },

    #[error("end of index data")]
    EndOfIndex,

    #[error("not the cluster leader")]
    NotLeader,

    #[error("apply timed out before commit")]
    ApplyTimeout,

    #[error("timed out waiting for a leader")]
    LeaderWaitTimeout,

    #[error("no server connection available")]
    NoServerAvailable,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("raft is shut down")]
    Shutdown,
}

impl From<prost::DecodeError> for QuillError {
    fn from(e: prost::DecodeError) -> Self {
        QuillError::Codec(e.to_string())
    }
}

impl From<prost::EncodeError> for QuillError {
    fn from(e: prost::EncodeError) -> Self {
        QuillError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuillError>;
