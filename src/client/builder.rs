/*
 * Copyright 2020 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// The default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// How long a lost connection waits before the next attempt
pub const DEFAULT_RECONNECT_SLEEP: Duration = Duration::from_millis(100);

/// How long a single connection attempt may take
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the server lives
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: PathBuf },
}

/// What to do when the Pub/Sub pending-message queue exceeds its bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBehaviour {
    /// Discard the whole queue, replacing it with a single notice carrying
    /// the number of messages lost
    Drop,
    /// Terminate the connection actor
    Exit,
}

/// Connection builder
///
/// Carries everything both kinds of connection need: the endpoint, the
/// credentials and database replayed on every (re)connect, the reconnect
/// policy, plus the Pub/Sub-only queueing options.
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    pub(crate) endpoint: Endpoint,
    pub(crate) username: Option<Arc<str>>,
    pub(crate) password: Option<Arc<str>>,
    pub(crate) database: Option<u32>,
    pub(crate) reconnect_sleep: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    #[cfg(feature = "tls")]
    pub(crate) tls: bool,
    pub(crate) max_queue_size: Option<usize>,
    pub(crate) queue_behaviour: QueueBehaviour,
}

impl ConnectionBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_endpoint(Endpoint::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Connect over a Unix-domain socket instead of TCP
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::with_endpoint(Endpoint::Unix { path: path.into() })
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            username: None,
            password: None,
            database: None,
            reconnect_sleep: Some(DEFAULT_RECONNECT_SLEEP),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            #[cfg(feature = "tls")]
            tls: false,
            max_queue_size: None,
            queue_behaviour: QueueBehaviour::Drop,
        }
    }

    /// Set the password used when connecting
    pub fn password<V: Into<Arc<str>>>(&mut self, password: V) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    /// Set the username used when connecting
    pub fn username<V: Into<Arc<str>>>(&mut self, username: V) -> &mut Self {
        self.username = Some(username.into());
        self
    }

    /// SELECT this database after connecting; skipped when unset
    pub fn database(&mut self, database: u32) -> &mut Self {
        self.database = Some(database);
        self
    }

    /// How long to wait after losing the connection before trying again
    pub fn reconnect_sleep(&mut self, sleep: Duration) -> &mut Self {
        self.reconnect_sleep = Some(sleep);
        self
    }

    /// Never reconnect: the first failure, at startup or later, is terminal
    pub fn no_reconnect(&mut self) -> &mut Self {
        self.reconnect_sleep = None;
        self
    }

    pub fn connect_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// Wrap the connection in TLS
    #[cfg(feature = "tls")]
    pub fn tls(&mut self) -> &mut Self {
        self.tls = true;
        self
    }

    /// Bound the Pub/Sub queue of messages awaiting acknowledgement;
    /// unbounded by default
    pub fn max_queue_size(&mut self, size: usize) -> &mut Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn queue_behaviour(&mut self, behaviour: QueueBehaviour) -> &mut Self {
        self.queue_behaviour = behaviour;
        self
    }
}
