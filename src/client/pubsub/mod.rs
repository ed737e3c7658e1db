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

use std::sync::Arc;

use futures_channel::mpsc;

use tokio::time;

use crate::{
    client::builder::ConnectionBuilder,
    client::connect::{connect_and_setup, ConnectionState},
    error::{ConnectionReason, Error},
    task,
};

use self::inner::PubsubConnectionInner;

/// One event delivered to the controlling subscriber.
///
/// Each event must be acknowledged with
/// [`ack_message`](PubsubConnection::ack_message) before the next one is
/// delivered; events arriving in the meantime wait in the actor's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubsubMessage {
    /// The server confirmed a channel or pattern subscription
    Subscribed(String),
    /// The server confirmed dropping a channel or pattern subscription
    Unsubscribed(String),
    /// A message published to a subscribed channel
    Message { channel: String, payload: Vec<u8> },
    /// A message published to a channel matching a subscribed pattern
    PatternMessage {
        pattern: String,
        channel: String,
        payload: Vec<u8>,
    },
    /// The connection was re-established after a loss; subscriptions have
    /// been re-issued
    Connected,
    /// The connection was lost; a reconnect is scheduled
    Disconnected,
    /// The pending queue overflowed and this many events were discarded
    Dropped(usize),
}

/// Requests from the handles to the connection actor
#[derive(Debug)]
pub(crate) enum PubsubEvent {
    Subscribe(Vec<String>),
    Psubscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Punsubscribe(Vec<String>),
    Control(mpsc::UnboundedSender<PubsubMessage>),
    Ack,
}

/// A shareable handle for Redis's PUBSUB functionality.
///
/// Subscription commands return as soon as the actor has taken them; the
/// corresponding `Subscribed`/`Unsubscribed` events arrive at the
/// controlling subscriber once the server confirms.
#[derive(Debug, Clone)]
pub struct PubsubConnection {
    out_tx: mpsc::UnboundedSender<PubsubEvent>,
}

impl ConnectionBuilder {
    /// Connect and return a Pub/Sub connection.
    ///
    /// The startup policy matches `paired_connect`: one connection attempt is
    /// made before this resolves, and failure is only returned here when
    /// reconnecting is disabled.
    pub async fn pubsub_connect(&self) -> Result<PubsubConnection, Error> {
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
            match PubsubConnectionInner::new(state, out_rx, builder).await {
                Ok(()) => (),
                Err(e) => log::error!("Pub/Sub connection actor failed: {}", e),
            }
        });

        Ok(PubsubConnection { out_tx })
    }
}

/// Connect to the given host and port for Pub/Sub with default options.
pub async fn pubsub_connect(
    host: impl Into<String>,
    port: u16,
) -> Result<PubsubConnection, Error> {
    ConnectionBuilder::new(host, port).pubsub_connect().await
}

impl PubsubConnection {
    /// Subscribes to one or more channels.  The subscription survives
    /// reconnects: it is re-issued on every fresh connection until
    /// `unsubscribe` is called for it.
    pub fn subscribe<T: Into<String>>(
        &self,
        channels: impl IntoIterator<Item = T>,
    ) -> Result<(), Error> {
        self.send(PubsubEvent::Subscribe(collect_strings(channels)))
    }

    /// Subscribes to one or more patterns, e.g. `news.*`
    pub fn psubscribe<T: Into<String>>(
        &self,
        patterns: impl IntoIterator<Item = T>,
    ) -> Result<(), Error> {
        self.send(PubsubEvent::Psubscribe(collect_strings(patterns)))
    }

    pub fn unsubscribe<T: Into<String>>(
        &self,
        channels: impl IntoIterator<Item = T>,
    ) -> Result<(), Error> {
        self.send(PubsubEvent::Unsubscribe(collect_strings(channels)))
    }

    pub fn punsubscribe<T: Into<String>>(
        &self,
        patterns: impl IntoIterator<Item = T>,
    ) -> Result<(), Error> {
        self.send(PubsubEvent::Punsubscribe(collect_strings(patterns)))
    }

    /// Makes `subscriber` the controlling subscriber: the single recipient of
    /// all events from this connection.
    ///
    /// Delivery is re-armed by the new controller's first `ack_message`; any
    /// queued events then flow to it one acknowledgement at a time.
    pub fn control(&self, subscriber: mpsc::UnboundedSender<PubsubMessage>) -> Result<(), Error> {
        self.send(PubsubEvent::Control(subscriber))
    }

    /// Convenience wrapper around [`control`](Self::control) that builds the
    /// channel pair and returns the receiving half.
    pub fn control_channel(&self) -> Result<mpsc::UnboundedReceiver<PubsubMessage>, Error> {
        let (tx, rx) = mpsc::unbounded();
        self.control(tx)?;
        Ok(rx)
    }

    /// Acknowledges the most recent event, allowing the next one to be
    /// delivered.  The first acknowledgement after `control` is what opens
    /// delivery in the first place.
    pub fn ack_message(&self) -> Result<(), Error> {
        self.send(PubsubEvent::Ack)
    }

    fn send(&self, event: PubsubEvent) -> Result<(), Error> {
        self.out_tx
            .unbounded_send(event)
            .map_err(|_| Error::Connection(ConnectionReason::ConnectionDropped))
    }
}

fn collect_strings<T: Into<String>>(items: impl IntoIterator<Item = T>) -> Vec<String> {
    items.into_iter().map(|item| item.into()).collect()
}
