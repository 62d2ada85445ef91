//! Error type shared by the server and the client.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::fcall::status;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream before a full frame was transferred.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The handle is unknown or was already destroyed.
    #[error("handle {0} not found")]
    HandleNotFound(u32),

    /// The backing store of a new handle could not be set up.
    #[error("cannot initialise store at {}: {source}", .path.display())]
    ResourceInit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The server answered with a nonzero status or an ERR frame.
    #[error("remote error, status {status}")]
    Remote { status: u32 },
}

impl Error {
    /// Status code reported on the wire for this error.
    pub fn status(&self) -> u32 {
        match *self {
            Error::Protocol(_) => status::MALFORMED,
            Error::ConnectionClosed | Error::Io(_) => status::IO,
            Error::HandleNotFound(_) => status::HANDLE_NOT_FOUND,
            Error::ResourceInit { .. } => status::RESOURCE_INIT,
            Error::Remote { status } => status,
        }
    }

    /// Map a status received from the server back onto an error.
    pub fn from_status(code: u32, handle: u32) -> Error {
        match code {
            status::HANDLE_NOT_FOUND => Error::HandleNotFound(handle),
            _ => Error::Remote { status: code },
        }
    }

    /// Whether the error only means the peer went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
