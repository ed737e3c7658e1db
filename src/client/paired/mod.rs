/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

mod inner;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use futures_channel::{mpsc, oneshot};

use tokio::time;

use crate::{
    client::builder::ConnectionBuilder,
    client::connect::{connect_and_setup, ConnectionState},
    error::{ConnectionReason, Error},
    protocol::resp::{Command, FromResp, RespValue},
    task,
};

use self::inner::PairedConnectionInner;

/// The tag identifying one asynchronously-submitted command; the subscriber
/// receives it back alongside the eventual reply.
pub type AsyncTag = u64;

/// One unit of work for the connection actor: a pre-encoded frame (one
/// command, or a whole pipeline), the number of replies it owes, and where
/// those replies go.
#[derive(Debug)]
pub(crate) struct Submission {
    frame: Bytes,
    expected: usize,
    responder: Responder,
}

#[derive(Debug)]
pub(crate) enum Responder {
    /// Fire-and-forget; the reply is still consumed to keep the queue
    /// aligned, then dropped
    Discard,
    Single(oneshot::Sender<Result<RespValue, Error>>),
    Pipeline(oneshot::Sender<Result<Vec<RespValue>, Error>>),
}

impl Responder {
    pub(crate) fn fail(self, err: Error) {
        match self {
            Responder::Discard => (),
            Responder::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Pipeline(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// A shareable handle to a connection that pairs each command with the reply
/// in the matching position, relying on Redis answering in request order.
///
/// Commands are sent in the order that `send` (or any of its variants) is
/// called, regardless of how the returned futures are realised; pipelining
/// happens implicitly whenever callers do not await one reply before issuing
/// the next command.
#[derive(Debug, Clone)]
pub struct PairedConnection {
    out_tx: mpsc::UnboundedSender<Submission>,
    tags: Arc<AtomicU64>,
}

impl ConnectionBuilder {
    /// Connect and return a paired connection.
    ///
    /// One connection attempt is made before this resolves.  If it fails and
    /// reconnecting is enabled the handle is returned anyway and the actor
    /// keeps trying in the background, failing submissions fast in the
    /// meantime; with reconnecting disabled the error is returned here.
    pub async fn paired_connect(&self) -> Result<PairedConnection, Error> {
        let builder = Arc::new(self.clone());

        let state = match connect_and_setup(&builder).await {
            Ok(con) => ConnectionState::Ready(con),
            Err(e) => match builder.reconnect_sleep {
                Some(sleep) => {
                    log::warn!("Initial connection failed, retrying in {:?}: {}", sleep, e);
                    ConnectionState::Sleeping(Box::pin(time::sleep(sleep)))
                }
                None => return Err(e),
            },
        };

        let (out_tx, out_rx) = mpsc::unbounded();
        task::spawn(async {
            match PairedConnectionInner::new(state, out_rx, builder).await {
                Ok(()) => (),
                Err(e) => log::error!("Connection actor failed: {}", e),
            }
        });

        Ok(PairedConnection {
            out_tx,
            tags: Arc::new(AtomicU64::new(0)),
        })
    }
}

/// Connect to the given host and port with default options.
pub async fn paired_connect(
    host: impl Into<String>,
    port: u16,
) -> Result<PairedConnection, Error> {
    ConnectionBuilder::new(host, port).paired_connect().await
}

impl PairedConnection {
    /// Sends a command to Redis.
    ///
    /// The command must be a single RESP command (constructed with e.g. the
    /// `cmd!` macro).  Returned is a future that resolves to the value
    /// returned from Redis.  The type must be one for which the
    /// `resp::FromResp` trait is defined.
    ///
    /// The future will fail for numerous reasons, including but not limited
    /// to: IO issues, conversion problems, and server-side errors being
    /// returned by Redis.
    ///
    /// Behind the scenes the command is queued up and sent to Redis
    /// asynchronously before the future is realised.  As such, it is
    /// guaranteed that commands are sent in the same order that `send` is
    /// called.
    pub async fn send<T: FromResp>(&self, cmd: Command) -> Result<T, Error> {
        let frame = cmd.to_wire_bytes()?;
        let (tx, rx) = oneshot::channel();
        self.submit(Submission {
            frame,
            expected: 1,
            responder: Responder::Single(tx),
        })?;
        match rx.await {
            Ok(Ok(value)) => T::from_resp(value),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Connection(ConnectionReason::ConnectionDropped)),
        }
    }

    /// As `send`, but gives up after `timeout`.  Expiry abandons only the
    /// wait: the command has already been sent (or will be), and its eventual
    /// reply is consumed and dropped.
    pub async fn send_timeout<T: FromResp>(
        &self,
        cmd: Command,
        timeout: Duration,
    ) -> Result<T, Error> {
        match time::timeout(timeout, self.send(cmd)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Sends a batch of commands as one contiguous write, returning one
    /// result per command in the same order.
    ///
    /// A server-side error reply only fails its own slot; the remaining
    /// replies are still collected.  Losing the connection while any reply is
    /// outstanding fails the whole call.  An empty batch resolves immediately
    /// without touching the connection.
    pub async fn send_pipeline(
        &self,
        cmds: Vec<Command>,
    ) -> Result<Vec<Result<RespValue, Error>>, Error> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }

        let expected = cmds.len();
        let mut buf = BytesMut::new();
        for cmd in cmds {
            cmd.encode_into(&mut buf)?;
        }

        let (tx, rx) = oneshot::channel();
        self.submit(Submission {
            frame: buf.freeze(),
            expected,
            responder: Responder::Pipeline(tx),
        })?;
        match rx.await {
            Ok(Ok(values)) => Ok(values.into_iter().map(RespValue::into_result).collect()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Connection(ConnectionReason::ConnectionDropped)),
        }
    }

    /// As `send_pipeline`, but gives up after `timeout`.
    pub async fn send_pipeline_timeout(
        &self,
        cmds: Vec<Command>,
        timeout: Duration,
    ) -> Result<Vec<Result<RespValue, Error>>, Error> {
        match time::timeout(timeout, self.send_pipeline(cmds)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Sends a command and drops the reply, whatever it turns out to be.
    ///
    /// Ordered with respect to later `send`s from the same caller: a
    /// subsequent `send` completes only after this command was written.
    pub fn send_and_forget(&self, cmd: Command) -> Result<(), Error> {
        let frame = cmd.to_wire_bytes()?;
        self.submit(Submission {
            frame,
            expected: 1,
            responder: Responder::Discard,
        })
    }

    /// Sends a command and returns immediately with a fresh tag; the
    /// subscriber later receives exactly one `(tag, result)` message.
    pub fn send_async(
        &self,
        cmd: Command,
        subscriber: mpsc::UnboundedSender<(AsyncTag, Result<RespValue, Error>)>,
    ) -> Result<AsyncTag, Error> {
        let frame = cmd.to_wire_bytes()?;
        let tag = self.next_tag();
        let (tx, rx) = oneshot::channel();
        self.submit(Submission {
            frame,
            expected: 1,
            responder: Responder::Single(tx),
        })?;
        task::spawn(async move {
            let result = match rx.await {
                Ok(Ok(value)) => value.into_result(),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Connection(ConnectionReason::ConnectionDropped)),
            };
            let _ = subscriber.unbounded_send((tag, result));
        });
        Ok(tag)
    }

    /// As `send_async`, for a batch; the delivered message wraps the full
    /// list of per-command results.
    pub fn send_pipeline_async(
        &self,
        cmds: Vec<Command>,
        subscriber: mpsc::UnboundedSender<(AsyncTag, Result<Vec<Result<RespValue, Error>>, Error>)>,
    ) -> Result<AsyncTag, Error> {
        let tag = self.next_tag();
        if cmds.is_empty() {
            let _ = subscriber.unbounded_send((tag, Ok(Vec::new())));
            return Ok(tag);
        }

        let expected = cmds.len();
        let mut buf = BytesMut::new();
        for cmd in cmds {
            cmd.encode_into(&mut buf)?;
        }

        let (tx, rx) = oneshot::channel();
        self.submit(Submission {
            frame: buf.freeze(),
            expected,
            responder: Responder::Pipeline(tx),
        })?;
        task::spawn(async move {
            let result = match rx.await {
                Ok(Ok(values)) => Ok(values.into_iter().map(RespValue::into_result).collect()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Connection(ConnectionReason::ConnectionDropped)),
            };
            let _ = subscriber.unbounded_send((tag, result));
        });
        Ok(tag)
    }

    fn next_tag(&self) -> AsyncTag {
        self.tags.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, submission: Submission) -> Result<(), Error> {
        self.out_tx
            .unbounded_send(submission)
            .map_err(|_| Error::Connection(ConnectionReason::ConnectionDropped))
    }
}
