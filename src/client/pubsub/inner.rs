/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;

use futures_channel::mpsc;
use futures_util::stream::{Fuse, StreamExt};

use crate::{
    client::builder::{ConnectionBuilder, QueueBehaviour},
    client::connect::{drain_writes, Advance, ConnectionState},
    error::{self, ConnectionReason, Error},
    protocol::resp::{FromResp, RespValue},
};

use super::{PubsubEvent, PubsubMessage};

/// Whether the controlling subscriber may be sent anything right now
enum MsgState {
    /// An event is out and unacknowledged (or nobody has acknowledged at
    /// all yet); everything queues
    NeedAck,
    /// The last event was acknowledged and the queue is empty
    Ready,
}

/// What went wrong while handling traffic
enum Fault {
    /// Lose the connection; reconnect if the policy allows
    Connection(Error),
    /// Terminate the actor
    Fatal(Error),
}

/// A spawned future that handles a Pub/Sub connection: it keeps the wanted
/// subscription sets, re-issues them after every reconnect, and forwards
/// classified events to the controlling subscriber one acknowledgement at a
/// time.
pub(crate) struct PubsubConnectionInner {
    builder: Arc<ConnectionBuilder>,
    state: ConnectionState,
    /// A stream onto which requests from the handles are read
    out_rx: Fuse<mpsc::UnboundedReceiver<PubsubEvent>>,
    /// Frames not yet pushed into the sink
    write_queue: VecDeque<Bytes>,
    /// Channels and patterns this connection should be subscribed to
    subscriptions: BTreeSet<String>,
    psubscriptions: BTreeSet<String>,
    /// Where events go; replaceable at runtime
    controller: Option<mpsc::UnboundedSender<PubsubMessage>>,
    msg_state: MsgState,
    /// Events waiting for the controller to acknowledge their predecessors
    msg_queue: VecDeque<PubsubMessage>,
}

impl PubsubConnectionInner {
    pub(crate) fn new(
        state: ConnectionState,
        out_rx: mpsc::UnboundedReceiver<PubsubEvent>,
        builder: Arc<ConnectionBuilder>,
    ) -> Self {
        PubsubConnectionInner {
            builder,
            state,
            out_rx: out_rx.fuse(),
            write_queue: VecDeque::new(),
            subscriptions: BTreeSet::new(),
            psubscriptions: BTreeSet::new(),
            controller: None,
            msg_state: MsgState::NeedAck,
            msg_queue: VecDeque::new(),
        }
    }

    /// A fresh socket has no subscription state on the server; replay the
    /// full sets before anything else is written.
    fn on_connected(&mut self) -> Result<(), Error> {
        if !self.subscriptions.is_empty() {
            let cmd = cmd!["SUBSCRIBE"].append(self.subscriptions.iter().map(|t| t.as_str()));
            self.write_queue.push_back(cmd.to_wire_bytes()?);
        }
        if !self.psubscriptions.is_empty() {
            let cmd = cmd!["PSUBSCRIBE"].append(self.psubscriptions.iter().map(|t| t.as_str()));
            self.write_queue.push_back(cmd.to_wire_bytes()?);
        }
        self.notify(PubsubMessage::Connected)
    }

    fn handle_event(&mut self, event: PubsubEvent) -> Result<(), Error> {
        match event {
            PubsubEvent::Subscribe(channels) => {
                self.subscriptions.extend(channels.iter().cloned());
                self.write_subscription("SUBSCRIBE", &channels)
            }
            PubsubEvent::Psubscribe(patterns) => {
                self.psubscriptions.extend(patterns.iter().cloned());
                self.write_subscription("PSUBSCRIBE", &patterns)
            }
            PubsubEvent::Unsubscribe(channels) => {
                for channel in &channels {
                    self.subscriptions.remove(channel);
                }
                self.write_subscription("UNSUBSCRIBE", &channels)
            }
            PubsubEvent::Punsubscribe(patterns) => {
                for pattern in &patterns {
                    self.psubscriptions.remove(pattern);
                }
                self.write_subscription("PUNSUBSCRIBE", &patterns)
            }
            PubsubEvent::Control(subscriber) => {
                self.controller = Some(subscriber);
                self.msg_state = MsgState::NeedAck;
                Ok(())
            }
            PubsubEvent::Ack => {
                match self.msg_queue.pop_front() {
                    // the next event goes out and is itself unacknowledged
                    Some(msg) => self.send_to_controller(msg),
                    None => self.msg_state = MsgState::Ready,
                }
                Ok(())
            }
        }
    }

    /// Issue a subscription command now when connected; a disconnected actor
    /// relies on the full replay that runs on reconnect.
    fn write_subscription(&mut self, verb: &str, topics: &[String]) -> Result<(), Error> {
        if topics.is_empty() || !self.state.is_ready() {
            return Ok(());
        }
        let cmd = cmd![verb].append(topics.iter().map(|t| t.as_str()));
        self.write_queue.push_back(cmd.to_wire_bytes()?);
        Ok(())
    }

    fn handle_reply(&mut self, value: RespValue) -> Result<(), Fault> {
        let parts = match value {
            RespValue::Array(parts) => parts,
            RespValue::Error(err) => {
                return Err(Fault::Connection(error::unexpected(format!(
                    "Error from server: {}",
                    err
                ))));
            }
            other => {
                return Err(Fault::Connection(error::unexpected(format!(
                    "Pub/Sub message should be encoded as an array, actual: {:?}",
                    other
                ))));
            }
        };

        match classify(parts) {
            Ok(event) => self.notify(event).map_err(Fault::Fatal),
            Err(e) => Err(Fault::Connection(e)),
        }
    }

    /// Hand one event to the controller under the active-once discipline, or
    /// queue it while an earlier one is still unacknowledged.  Failure means
    /// the queue overflowed with `QueueBehaviour::Exit` in force.
    fn notify(&mut self, msg: PubsubMessage) -> Result<(), Error> {
        let can_send = matches!(self.msg_state, MsgState::Ready)
            && self.msg_queue.is_empty()
            && self.controller.is_some();
        if can_send {
            self.send_to_controller(msg);
            self.msg_state = MsgState::NeedAck;
            return Ok(());
        }

        self.msg_queue.push_back(msg);
        if let Some(max) = self.builder.max_queue_size {
            if self.msg_queue.len() > max {
                let dropped = self.msg_queue.len();
                match self.builder.queue_behaviour {
                    QueueBehaviour::Drop => {
                        log::warn!("Pub/Sub queue overflowed, discarding {} events", dropped);
                        self.msg_queue.clear();
                        self.msg_queue.push_back(PubsubMessage::Dropped(dropped));
                    }
                    QueueBehaviour::Exit => {
                        return Err(error::internal(format!(
                            "Pub/Sub queue overflowed at {} events",
                            dropped
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn send_to_controller(&mut self, msg: PubsubMessage) {
        if let Some(controller) = &self.controller {
            if controller.unbounded_send(msg).is_err() {
                // subsequent events queue until someone takes control again
                log::warn!("Controlling subscriber has gone away, event dropped");
                self.controller = None;
            }
        }
    }
}

/// Split an incoming array into the event it announces.
fn classify(parts: Vec<RespValue>) -> Result<PubsubMessage, Error> {
    let arity = parts.len();
    let mut parts = parts.into_iter();
    let kind = match parts.next() {
        Some(RespValue::BulkString(bytes)) => bytes,
        _ => return Err(error::unexpected("Incorrect format of a Pub/Sub message")),
    };

    match (kind.as_slice(), arity) {
        // the trailing element of (un)subscribe confirmations is the
        // remaining subscription count, which nobody here needs
        (b"subscribe", 3) | (b"psubscribe", 3) => {
            Ok(PubsubMessage::Subscribed(next_string(&mut parts)?))
        }
        (b"unsubscribe", 3) | (b"punsubscribe", 3) => {
            Ok(PubsubMessage::Unsubscribed(next_string(&mut parts)?))
        }
        (b"message", 3) => Ok(PubsubMessage::Message {
            channel: next_string(&mut parts)?,
            payload: next_bytes(&mut parts)?,
        }),
        (b"pmessage", 4) => Ok(PubsubMessage::PatternMessage {
            pattern: next_string(&mut parts)?,
            channel: next_string(&mut parts)?,
            payload: next_bytes(&mut parts)?,
        }),
        (kind, _) => Err(error::unexpected(format!(
            "Unexpected Pub/Sub message: {} with {} parts",
            String::from_utf8_lossy(kind),
            arity
        ))),
    }
}

fn next_string(parts: &mut std::vec::IntoIter<RespValue>) -> Result<String, Error> {
    match parts.next() {
        Some(value) => String::from_resp(value),
        None => Err(error::unexpected("Pub/Sub message ended early")),
    }
}

fn next_bytes(parts: &mut std::vec::IntoIter<RespValue>) -> Result<Vec<u8>, Error> {
    match parts.next() {
        Some(value) => Vec::from_resp(value),
        None => Err(error::unexpected("Pub/Sub message ended early")),
    }
}

impl Future for PubsubConnectionInner {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            match this.state.poll_advance(&this.builder, cx) {
                Advance::Changed { became_ready } => {
                    if became_ready {
                        if let Err(e) = this.on_connected() {
                            return Poll::Ready(Err(e));
                        }
                    }
                    continue;
                }
                Advance::Parked => (),
                Advance::GaveUp(e) => return Poll::Ready(Err(e)),
            }

            loop {
                match this.out_rx.poll_next_unpin(cx) {
                    Poll::Ready(Some(event)) => {
                        if let Err(e) = this.handle_event(event) {
                            return Poll::Ready(Err(e));
                        }
                    }
                    Poll::Ready(None) | Poll::Pending => break,
                }
            }

            let mut failure = None;
            let mut replies = Vec::new();
            if let ConnectionState::Ready(con) = &mut this.state {
                if let Err(e) = drain_writes(con, &mut this.write_queue, cx) {
                    failure = Some(e);
                } else {
                    loop {
                        match con.poll_next_unpin(cx) {
                            Poll::Pending => break,
                            Poll::Ready(Some(Ok(value))) => replies.push(value),
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

            for value in replies {
                match this.handle_reply(value) {
                    Ok(()) => (),
                    Err(Fault::Connection(e)) => {
                        failure = Some(e);
                        break;
                    }
                    Err(Fault::Fatal(e)) => return Poll::Ready(Err(e)),
                }
            }

            if let Some(err) = failure {
                log::warn!("Pub/Sub connection failed: {}", err);
                this.write_queue.clear();
                if let Err(e) = this.notify(PubsubMessage::Disconnected) {
                    return Poll::Ready(Err(e));
                }
                if this.state.begin_reconnect(&this.builder) {
                    continue;
                }
                return Poll::Ready(Err(Error::Connection(ConnectionReason::ConnectionDropped)));
            }

            if this.out_rx.is_done() {
                return Poll::Ready(Ok(()));
            }

            return Poll::Pending;
        }
    }
}
