/*
 * Copyright 2017-2023 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The client API itself.
//!
//! Two types of client are provided:
//!
//! * `paired_connect` is used for most of the standard Redis commands, where
//! one request results in one response.
//! * `pubsub_connect` is used for Redis's PUBSUB functionality.
//!
//! Both own their socket exclusively from a spawned actor, reconnect
//! automatically (unless configured otherwise), and are driven through
//! cheaply-cloneable handles.

pub mod builder;
pub(crate) mod connect;
pub mod paired;
pub mod pubsub;

pub use self::builder::{ConnectionBuilder, Endpoint, QueueBehaviour};
pub use self::paired::{paired_connect, AsyncTag, PairedConnection};
pub use self::pubsub::{pubsub_connect, PubsubConnection, PubsubMessage};
