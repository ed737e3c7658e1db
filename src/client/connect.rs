/*
 * Copyright 2017-2020 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Opening connections, and the lifecycle shared by both connection actors.
//!
//! A `RespConnection` reads and writes RESP over whichever transport the
//! builder asked for.  A `ConnectionState` drives it through the
//! sleep/connect/ready cycle: every (re)connect runs the same setup exchange
//! (AUTH when a password is configured, then SELECT when a database is
//! configured) before the connection is handed back to the actor as ready.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;

use futures_sink::Sink;
use futures_util::{SinkExt, Stream, StreamExt};

use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time;

use tokio_util::codec::{Decoder, Framed};

use crate::{
    client::builder::{ConnectionBuilder, Endpoint},
    error::{self, Error},
    protocol::{
        resp::{Command, RespValue},
        FromResp, RespCodec,
    },
};

/// A framed RESP connection over any of the supported transports.
///
/// Reads whole replies; writes pre-encoded command frames.  The sink and
/// stream sides behave independently of each other.
pub(crate) enum RespConnection {
    Tcp(Framed<TcpStream, RespCodec>),
    #[cfg(unix)]
    Unix(Framed<UnixStream, RespCodec>),
    #[cfg(feature = "tls")]
    Tls(Framed<tokio_native_tls::TlsStream<TcpStream>, RespCodec>),
}

impl Stream for RespConnection {
    type Item = Result<RespValue, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_next(cx),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_next(cx),
            #[cfg(feature = "tls")]
            RespConnection::Tls(framed) => Pin::new(framed).poll_next(cx),
        }
    }
}

impl Sink<Bytes> for RespConnection {
    type Error = Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_ready(cx),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_ready(cx),
            #[cfg(feature = "tls")]
            RespConnection::Tls(framed) => Pin::new(framed).poll_ready(cx),
        }
    }

    fn start_send(self: Pin<&mut Self>, frame: Bytes) -> Result<(), Error> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).start_send(frame),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).start_send(frame),
            #[cfg(feature = "tls")]
            RespConnection::Tls(framed) => Pin::new(framed).start_send(frame),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_flush(cx),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_flush(cx),
            #[cfg(feature = "tls")]
            RespConnection::Tls(framed) => Pin::new(framed).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        match self.get_mut() {
            RespConnection::Tcp(framed) => Pin::new(framed).poll_close(cx),
            #[cfg(unix)]
            RespConnection::Unix(framed) => Pin::new(framed).poll_close(cx),
            #[cfg(feature = "tls")]
            RespConnection::Tls(framed) => Pin::new(framed).poll_close(cx),
        }
    }
}

/// Open the configured transport, bounded by the connect timeout.
async fn connect_transport(builder: &ConnectionBuilder) -> Result<RespConnection, Error> {
    match &builder.endpoint {
        Endpoint::Tcp { host, port } => {
            let connect_f = TcpStream::connect((host.as_str(), *port));
            let stream = match time::timeout(builder.connect_timeout, connect_f).await {
                Ok(stream) => stream?,
                Err(_) => return Err(Error::Timeout),
            };

            #[cfg(feature = "tls")]
            if builder.tls {
                let connector =
                    tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
                let stream = connector.connect(host, stream).await?;
                return Ok(RespConnection::Tls(RespCodec::new().framed(stream)));
            }

            Ok(RespConnection::Tcp(RespCodec::new().framed(stream)))
        }
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let connect_f = UnixStream::connect(path);
            let stream = match time::timeout(builder.connect_timeout, connect_f).await {
                Ok(stream) => stream?,
                Err(_) => return Err(Error::Timeout),
            };
            Ok(RespConnection::Unix(RespCodec::new().framed(stream)))
        }
    }
}

/// One command/reply exchange during connection setup; anything other than
/// `+OK` aborts the attempt.
async fn exchange(con: &mut RespConnection, cmd: Command, doing: &str) -> Result<(), Error> {
    con.send(cmd.to_wire_bytes()?).await?;
    match con.next().await {
        Some(Ok(value)) => <() as FromResp>::from_resp(value),
        Some(Err(e)) => Err(e),
        None => Err(error::internal(format!(
            "Connection closed before {} completed",
            doing
        ))),
    }
}

/// Open a connection and run the setup exchanges.  This is the whole of a
/// single connection attempt; it runs identically at startup and on every
/// reconnect.
pub(crate) async fn connect_and_setup(builder: &ConnectionBuilder) -> Result<RespConnection, Error> {
    let mut con = connect_transport(builder).await?;

    if let Some(password) = &builder.password {
        let mut auth = cmd!["AUTH"];
        if let Some(username) = &builder.username {
            auth.push(&**username);
        }
        auth.push(&**password);
        exchange(&mut con, auth, "authentication").await?;
    }

    if let Some(database) = builder.database {
        exchange(&mut con, cmd!["SELECT", database], "database selection").await?;
    }

    Ok(con)
}

type ConnectFuture = Pin<Box<dyn Future<Output = Result<RespConnection, Error>> + Send>>;

/// Where a connection actor currently stands with its socket
pub(crate) enum ConnectionState {
    Ready(RespConnection),
    Connecting(ConnectFuture),
    Sleeping(Pin<Box<time::Sleep>>),
}

/// What `poll_advance` did
pub(crate) enum Advance {
    /// The state moved on; poll again from the top
    Changed { became_ready: bool },
    /// Nothing to do until a registered waker fires
    Parked,
    /// A connection attempt failed and reconnecting is disabled
    GaveUp(Error),
}

impl ConnectionState {
    pub(crate) fn connect_now(builder: &Arc<ConnectionBuilder>) -> Self {
        let builder = builder.clone();
        ConnectionState::Connecting(Box::pin(async move { connect_and_setup(&builder).await }))
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready(_))
    }

    /// Drive the sleep/connect transitions one step.
    pub(crate) fn poll_advance(
        &mut self,
        builder: &Arc<ConnectionBuilder>,
        cx: &mut Context<'_>,
    ) -> Advance {
        match self {
            ConnectionState::Ready(_) => Advance::Parked,
            ConnectionState::Sleeping(sleep) => match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    *self = Self::connect_now(builder);
                    Advance::Changed {
                        became_ready: false,
                    }
                }
                Poll::Pending => Advance::Parked,
            },
            ConnectionState::Connecting(connect_f) => match connect_f.as_mut().poll(cx) {
                Poll::Ready(Ok(con)) => {
                    log::info!("Connection established");
                    *self = ConnectionState::Ready(con);
                    Advance::Changed { became_ready: true }
                }
                Poll::Ready(Err(e)) => match builder.reconnect_sleep {
                    Some(sleep) => {
                        log::warn!("Connection attempt failed, retrying in {:?}: {}", sleep, e);
                        *self = ConnectionState::Sleeping(Box::pin(time::sleep(sleep)));
                        Advance::Changed {
                            became_ready: false,
                        }
                    }
                    None => Advance::GaveUp(e),
                },
                Poll::Pending => Advance::Parked,
            },
        }
    }

    /// Leave `Ready` after losing the socket.  Returns `false` when
    /// reconnecting is disabled and the actor should terminate instead.
    pub(crate) fn begin_reconnect(&mut self, builder: &ConnectionBuilder) -> bool {
        match builder.reconnect_sleep {
            Some(sleep) => {
                *self = ConnectionState::Sleeping(Box::pin(time::sleep(sleep)));
                true
            }
            None => false,
        }
    }
}

/// Push as much of the write queue into the sink as it will take, then
/// flush.  Frames enter the sink in queue order, so wire order always equals
/// queue order.
pub(crate) fn drain_writes(
    con: &mut RespConnection,
    queue: &mut VecDeque<Bytes>,
    cx: &mut Context<'_>,
) -> Result<(), Error> {
    while !queue.is_empty() {
        match Pin::new(&mut *con).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                if let Some(frame) = queue.pop_front() {
                    Pin::new(&mut *con).start_send(frame)?;
                }
            }
            Poll::Ready(Err(e)) => return Err(e),
            Poll::Pending => break,
        }
    }
    match Pin::new(&mut *con).poll_flush(cx) {
        Poll::Ready(Err(e)) => Err(e),
        _ => Ok(()),
    }
}
