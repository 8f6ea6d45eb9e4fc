use std::time::Duration;
use thiserror::Error;


/// Errors that travel through the mesh as part of a terminal value. They need to be cloneable
///  because a single terminal value is handed to every pending request of a stream.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MeshError {
    #[error("read timeout: no response to request {request_id} within {timeout:?}")]
    ReadTimeout {
        request_id: String,
        timeout: Duration,
    },
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    /// an error raised on the other side of a stream, decoded from the wire
    #[error("{0}")]
    Remote(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl MeshError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, MeshError::ReadTimeout { .. })
    }
}
