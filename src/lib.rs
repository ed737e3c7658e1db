/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A client for Redis using Tokio.
//!
//! Two interfaces are provided: a connection for ordinary request/response
//! commands, and a separate connection for Redis's PUBSUB functionality.
//!
//! ## Request/response
//!
//! [`client::paired_connect`](client/paired/fn.paired_connect.html) is used for most Redis commands
//! (those for which one command returns one response; it is not suitable for PUBSUB, `MONITOR` or
//! other similar commands).  It allows a Redis command to be sent and a Future returned for each
//! command.
//!
//! Commands will be sent in the order that `send` is called, regardless of how the future is
//! realised.  This is to allow us to take advantage of Redis's features by implicitly pipelining
//! commands where appropriate.  One side-effect of this is that for many commands, e.g. `SET` we
//! don't need to realise the future at all, it can be assumed to be fire-and-forget (see
//! [`send_and_forget`](client/paired/struct.PairedConnection.html#method.send_and_forget)); but,
//! the final future of the final command does need to be realised (at least) to ensure that the
//! correct behaviour is observed.
//!
//! Batches of commands can also be submitted atomically with `send_pipeline`, and replies can be
//! routed to a separate subscriber with `send_async` when suspending the caller is not an option.
//!
//! While the connection is down — the server restarting, say — submissions fail immediately
//! rather than queueing, and the connection re-establishes itself in the background, replaying
//! authentication and database selection before accepting traffic again.
//!
//! ## PUBSUB
//!
//! PUBSUB in Redis works differently.  A connection will subscribe to one or more topics, then
//! receive all messages that are published to that topic.  As such the
//! single-request/single-response model of `paired_connect` will not work.  A specific
//! [`client::pubsub_connect`](client/pubsub/fn.pubsub_connect.html) is provided for this purpose.
//!
//! Events flow to a single controlling subscriber, one at a time: each delivered event must be
//! acknowledged before the next is sent, and undelivered events wait in a bounded queue inside
//! the connection.  This keeps a slow consumer from accumulating an unbounded backlog unnoticed.

#[macro_use]
pub mod protocol;

pub mod client;
pub mod error;

mod task;

pub use crate::protocol::resp;
