/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;

use futures_channel::mpsc;
use futures_util::stream::{Fuse, StreamExt};

use crate::{
    client::builder::ConnectionBuilder,
    client::connect::{drain_writes, Advance, ConnectionState},
    error::{self, ConnectionReason, Error},
    protocol::resp::RespValue,
};

use super::{Responder, Submission};

/// A spawned future owning one connection, its in-flight queue, and its
/// reconnect cycle.
///
/// All three input sources are polled from here: caller submissions, the
/// socket, and the reconnect timer.  Nothing else ever touches the
/// connection, so no locking is needed anywhere.
pub(crate) struct PairedConnectionInner {
    builder: Arc<ConnectionBuilder>,
    state: ConnectionState,
    /// A stream onto which submissions from the handles are read
    out_rx: Fuse<mpsc::UnboundedReceiver<Submission>>,
    /// Frames accepted but not yet pushed into the sink
    write_queue: VecDeque<Bytes>,
    /// Whoever is owed replies, in wire order
    in_flight: VecDeque<InFlight>,
}

/// One entry of the in-flight queue: how many replies are still owed and
/// where the accumulated result goes.
struct InFlight {
    expected: usize,
    acc: Vec<RespValue>,
    responder: Responder,
}

impl InFlight {
    fn new(expected: usize, responder: Responder) -> Self {
        InFlight {
            expected,
            acc: Vec::with_capacity(expected),
            responder,
        }
    }

    fn complete(self) {
        match self.responder {
            Responder::Discard => (),
            Responder::Single(tx) => {
                if let Some(value) = self.acc.into_iter().next() {
                    // the caller may have timed out and gone; the reply has
                    // served its purpose by popping the queue
                    let _ = tx.send(Ok(value));
                }
            }
            Responder::Pipeline(tx) => {
                let _ = tx.send(Ok(self.acc));
            }
        }
    }
}

impl PairedConnectionInner {
    pub(crate) fn new(
        state: ConnectionState,
        out_rx: mpsc::UnboundedReceiver<Submission>,
        builder: Arc<ConnectionBuilder>,
    ) -> Self {
        PairedConnectionInner {
            builder,
            state,
            out_rx: out_rx.fuse(),
            write_queue: VecDeque::new(),
            in_flight: VecDeque::new(),
        }
    }

    /// Fail every pending caller; runs whenever the connection is lost, so
    /// that nobody waits on a reply that can no longer arrive.
    fn fail_all(&mut self) {
        self.write_queue.clear();
        for entry in self.in_flight.drain(..) {
            entry
                .responder
                .fail(Error::Connection(ConnectionReason::ConnectionDropped));
        }
    }

    /// Move submissions out of the inbox: onto the write queue while the
    /// connection is ready, failed immediately otherwise.  Entries join the
    /// in-flight queue in the same order their frames join the write queue.
    fn take_submissions(&mut self, cx: &mut Context<'_>) {
        loop {
            match self.out_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(submission)) => {
                    if self.state.is_ready() {
                        self.write_queue.push_back(submission.frame);
                        self.in_flight
                            .push_back(InFlight::new(submission.expected, submission.responder));
                    } else {
                        submission
                            .responder
                            .fail(Error::Connection(ConnectionReason::NotConnected));
                    }
                }
                Poll::Ready(None) | Poll::Pending => return,
            }
        }
    }

    /// Route one decoded reply to the head of the in-flight queue.
    fn dispatch(in_flight: &mut VecDeque<InFlight>, value: RespValue) -> Result<(), Error> {
        match in_flight.front_mut() {
            Some(entry) => {
                entry.acc.push(value);
                if entry.acc.len() == entry.expected {
                    if let Some(entry) = in_flight.pop_front() {
                        entry.complete();
                    }
                }
                Ok(())
            }
            None => Err(error::unexpected(
                "Reply arrived but nothing was in flight",
            )),
        }
    }
}

impl Future for PairedConnectionInner {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.state.poll_advance(&this.builder, cx) {
                Advance::Changed { .. } => continue,
                Advance::Parked => (),
                Advance::GaveUp(e) => {
                    this.fail_all();
                    return Poll::Ready(Err(e));
                }
            }

            this.take_submissions(cx);

            let mut failure = None;
            if let ConnectionState::Ready(con) = &mut this.state {
                if let Err(e) = drain_writes(con, &mut this.write_queue, cx) {
                    failure = Some(e);
                } else {
                    loop {
                        match con.poll_next_unpin(cx) {
                            Poll::Pending => break,
                            Poll::Ready(Some(Ok(value))) => {
                                if let Err(e) = Self::dispatch(&mut this.in_flight, value) {
                                    failure = Some(e);
                                    break;
                                }
                            }
                            Poll::Ready(Some(Err(e))) => {
                                failure = Some(e);
                                break;
                            }
                            Poll::Ready(None) => {
                                failure =
                                    Some(Error::Connection(ConnectionReason::ConnectionDropped));
                                break;
                            }
                        }
                    }
                }
            }

            if let Some(err) = failure {
                log::warn!("Connection failed: {}", err);
                this.fail_all();
                if this.state.begin_reconnect(&this.builder) {
                    continue;
                }
                return Poll::Ready(Err(Error::Connection(ConnectionReason::ConnectionDropped)));
            }

            // With the inbox closed and nothing owed, the connection has no
            // possible further work
            if this.out_rx.is_done() && this.in_flight.is_empty() && this.write_queue.is_empty() {
                return Poll::Ready(Ok(()));
            }

            return Poll::Pending;
        }
    }
}
