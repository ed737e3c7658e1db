/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{error, fmt, io};

use crate::protocol::resp::RespValue;

#[derive(Debug)]
pub enum Error {
    /// A non-specific internal error that prevented an operation from
    /// completing
    Internal(String),

    /// An IO error occurred
    IO(io::Error),

    /// A RESP parsing/serialising error occurred
    RESP(String, Option<RespValue>),

    /// A remote error returned by the Redis server
    Remote(String),

    /// The command contained a floating-point argument.  Floats do not
    /// round-trip through their textual form losslessly, so they are refused
    /// outright; callers must format them explicitly.
    CannotStoreFloats(f64),

    /// Error creating a connection, or an error with a connection being used
    Connection(ConnectionReason),

    /// The caller-side timeout elapsed before the reply arrived.  The command
    /// itself is not cancelled; any eventual reply is discarded.
    Timeout,

    /// An unexpected error, e.g. replies out of step with requests
    Unexpected(String),
}

pub(crate) fn internal(msg: impl Into<String>) -> Error {
    Error::Internal(msg.into())
}

pub(crate) fn unexpected(msg: impl Into<String>) -> Error {
    Error::Unexpected(msg.into())
}

pub(crate) fn resp(msg: impl Into<String>, resp: RespValue) -> Error {
    Error::RESP(msg.into(), Some(resp))
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

#[cfg(feature = "tls")]
impl From<native_tls::Error> for Error {
    fn from(err: native_tls::Error) -> Error {
        Error::Unexpected(format!("TLS error: {}", err))
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IO(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Internal(s) => write!(f, "{}", s),
            Error::IO(err) => write!(f, "{}", err),
            Error::RESP(s, resp) => write!(f, "{}: {:?}", s, resp),
            Error::Remote(s) => write!(f, "{}", s),
            Error::CannotStoreFloats(value) => {
                write!(f, "Cannot store floats, convert to string first: {}", value)
            }
            Error::Connection(ConnectionReason::NotConnected) => {
                write!(f, "Connection has been closed and will be re-opened")
            }
            Error::Connection(ConnectionReason::ConnectionDropped) => {
                write!(f, "The connection was dropped while replies were pending")
            }
            Error::Timeout => write!(f, "Timed out waiting for a reply"),
            Error::Unexpected(err) => write!(f, "{}", err),
        }
    }
}

/// Details of a `ConnectionError`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionReason {
    /// The connection is not currently connected, submissions fail fast while
    /// the connection reconnects asynchronously, clients should try again
    NotConnected,
    /// The connection was lost (or the client shut down) while replies were
    /// still owed; pending callers are failed with this
    ConnectionDropped,
}
