//! An in-process Redis stand-in for the integration tests.
//!
//! It speaks just enough RESP to exercise the client: strings, transactions,
//! subscriptions, authentication, plus two special keys (`__hang__*` never
//! answers, `__slow__*` answers late) and a kill switch for dropping live
//! sockets, so connection-loss behaviour can be tested deterministically.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Notify;

pub struct MockRedis {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

struct ServerState {
    password: Option<String>,
    store: Mutex<HashMap<String, Vec<u8>>>,
    connections: Mutex<Vec<ConnectionHandle>>,
    accepted: AtomicUsize,
    /// (connection number, command name) in arrival order
    log: Mutex<Vec<(usize, String)>>,
    kill: Notify,
}

struct ConnectionHandle {
    id: usize,
    out: UnboundedSender<Vec<u8>>,
    channels: Arc<Mutex<HashSet<String>>>,
    patterns: Arc<Mutex<HashSet<String>>>,
}

impl MockRedis {
    pub async fn start() -> MockRedis {
        Self::start_inner(None).await
    }

    pub async fn start_with_password(password: &str) -> MockRedis {
        Self::start_inner(Some(password.to_owned())).await
    }

    async fn start_inner(password: Option<String>) -> MockRedis {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            password,
            store: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            kill: Notify::new(),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_connection(stream, accept_state.clone(), id));
            }
        });

        MockRedis { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// How many connections have ever been accepted
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Every command received so far, tagged with its connection number
    pub fn commands(&self) -> Vec<(usize, String)> {
        self.state.log.lock().unwrap().clone()
    }

    /// How many live connections are subscribed to `channel`
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let connections = self.state.connections.lock().unwrap();
        connections
            .iter()
            .filter(|con| {
                con.channels.lock().unwrap().contains(channel)
                    || con
                        .patterns
                        .lock()
                        .unwrap()
                        .iter()
                        .any(|pattern| glob_match(pattern, channel))
            })
            .count()
    }

    /// Wait until `channel` has at least one subscriber
    pub async fn await_subscriber(&self, channel: &str) {
        for _ in 0..100 {
            if self.subscriber_count(channel) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no subscriber for {} appeared", channel);
    }

    /// Drop every open connection at the socket level
    pub fn kill_connections(&self) {
        self.state.kill.notify_waiters();
    }

    /// Deliver a message to every connection subscribed to `channel`,
    /// directly or through a pattern
    pub fn publish(&self, channel: &str, payload: &[u8]) {
        let connections = self.state.connections.lock().unwrap();
        for con in connections.iter() {
            if con.channels.lock().unwrap().contains(channel) {
                let _ = con.out.send(message_frame(channel, payload));
            }
            for pattern in con.patterns.lock().unwrap().iter() {
                if glob_match(pattern, channel) {
                    let _ = con.out.send(pmessage_frame(pattern, channel, payload));
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>, id: usize) {
    let (mut rd, mut wr) = stream.into_split();
    let (out_tx, mut out_rx) = unbounded_channel::<Vec<u8>>();
    let channels = Arc::new(Mutex::new(HashSet::new()));
    let patterns = Arc::new(Mutex::new(HashSet::new()));
    state.connections.lock().unwrap().push(ConnectionHandle {
        id,
        out: out_tx.clone(),
        channels: channels.clone(),
        patterns: patterns.clone(),
    });

    let mut session = Session {
        state: state.clone(),
        id,
        out: out_tx,
        channels,
        patterns,
        authed: state.password.is_none(),
        multi: None,
    };

    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        tokio::select! {
            _ = state.kill.notified() => break,
            msg = out_rx.recv() => match msg {
                Some(bytes) => {
                    if wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = rd.read(&mut chunk) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    acc.extend_from_slice(&chunk[..n]);
                    while let Some(args) = parse_command(&mut acc) {
                        session.handle(args).await;
                    }
                }
            },
        }
    }

    state.connections.lock().unwrap().retain(|con| con.id != id);
}

struct Session {
    state: Arc<ServerState>,
    id: usize,
    out: UnboundedSender<Vec<u8>>,
    channels: Arc<Mutex<HashSet<String>>>,
    patterns: Arc<Mutex<HashSet<String>>>,
    authed: bool,
    multi: Option<Vec<Vec<Vec<u8>>>>,
}

impl Session {
    async fn handle(&mut self, args: Vec<Vec<u8>>) {
        if args.is_empty() {
            return;
        }
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        self.state.log.lock().unwrap().push((self.id, name.clone()));

        if !self.authed && name != "AUTH" {
            self.send(error_reply("NOAUTH Authentication required."));
            return;
        }

        if self.multi.is_some() && name != "MULTI" && name != "EXEC" && name != "DISCARD" {
            if let Some(queued) = self.multi.as_mut() {
                queued.push(args);
            }
            self.send(simple_reply("QUEUED"));
            return;
        }

        if name == "GET" && args.len() == 2 {
            let key = String::from_utf8_lossy(&args[1]).into_owned();
            // a key that never answers, for testing in-flight failures
            if key.starts_with("__hang__") {
                return;
            }
            // a key that answers late, for testing caller-side timeouts
            if key.starts_with("__slow__") {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let reply = self.get_reply(&key);
                self.send(reply);
                return;
            }
        }

        if let Some(reply) = self.execute(&name, &args) {
            self.send(reply);
        }
    }

    fn execute(&mut self, name: &str, args: &[Vec<u8>]) -> Option<Vec<u8>> {
        match name {
            "AUTH" => match &self.state.password {
                Some(expected)
                    if args.len() >= 2 && args[args.len() - 1] == expected.as_bytes() =>
                {
                    self.authed = true;
                    Some(simple_reply("OK"))
                }
                Some(_) => Some(error_reply("ERR invalid password")),
                None => Some(simple_reply("OK")),
            },
            "SELECT" => Some(simple_reply("OK")),
            "PING" => Some(simple_reply("PONG")),
            "SET" if args.len() == 3 => {
                let key = String::from_utf8_lossy(&args[1]).into_owned();
                self.state.store.lock().unwrap().insert(key, args[2].clone());
                Some(simple_reply("OK"))
            }
            "GET" if args.len() == 2 => {
                let key = String::from_utf8_lossy(&args[1]).into_owned();
                Some(self.get_reply(&key))
            }
            "DEL" => {
                let mut store = self.state.store.lock().unwrap();
                let mut removed = 0;
                for key in &args[1..] {
                    let key = String::from_utf8_lossy(key).into_owned();
                    if store.remove(&key).is_some() {
                        removed += 1;
                    }
                }
                Some(integer_reply(removed))
            }
            "MULTI" => {
                self.multi = Some(Vec::new());
                Some(simple_reply("OK"))
            }
            "EXEC" => match self.multi.take() {
                Some(queued) => {
                    let mut reply = format!("*{}\r\n", queued.len()).into_bytes();
                    for queued_args in queued {
                        let queued_name = String::from_utf8_lossy(&queued_args[0]).to_uppercase();
                        match self.execute(&queued_name, &queued_args) {
                            Some(bytes) => reply.extend(bytes),
                            None => reply.extend(nil_reply()),
                        }
                    }
                    Some(reply)
                }
                None => Some(error_reply("ERR EXEC without MULTI")),
            },
            "SUBSCRIBE" => Some(self.subscription(&args[1..], "subscribe")),
            "UNSUBSCRIBE" => Some(self.subscription(&args[1..], "unsubscribe")),
            "PSUBSCRIBE" => Some(self.subscription(&args[1..], "psubscribe")),
            "PUNSUBSCRIBE" => Some(self.subscription(&args[1..], "punsubscribe")),
            _ => Some(error_reply(&format!("ERR unknown command '{}'", name))),
        }
    }

    fn subscription(&mut self, topics: &[Vec<u8>], kind: &str) -> Vec<u8> {
        let mut reply = Vec::new();
        for topic in topics {
            let name = String::from_utf8_lossy(topic).into_owned();
            let registry = if kind.starts_with('p') {
                &self.patterns
            } else {
                &self.channels
            };
            let count = {
                let mut registry = registry.lock().unwrap();
                if kind.contains("un") {
                    registry.remove(&name);
                } else {
                    registry.insert(name.clone());
                }
                registry.len()
            };
            reply.extend(subscription_frame(kind, topic, count));
        }
        reply
    }

    fn get_reply(&self, key: &str) -> Vec<u8> {
        match self.state.store.lock().unwrap().get(key) {
            Some(value) => bulk_reply(value),
            None => nil_reply(),
        }
    }

    fn send(&self, bytes: Vec<u8>) {
        let _ = self.out.send(bytes);
    }
}

/// Parse one complete multibulk command off the front of `buf`, if present
fn parse_command(buf: &mut Vec<u8>) -> Option<Vec<Vec<u8>>> {
    let mut pos = 0usize;

    let header = read_line(buf, &mut pos)?;
    if header.first() != Some(&b'*') {
        panic!("client sent a non-multibulk command: {:?}", header);
    }
    let argc = std::str::from_utf8(&header[1..]).ok()?.parse::<usize>().ok()?;

    let mut args = Vec::with_capacity(argc);
    for _ in 0..argc {
        let length = read_line(buf, &mut pos)?;
        if length.first() != Some(&b'$') {
            panic!("client sent a non-bulk argument: {:?}", length);
        }
        let len = std::str::from_utf8(&length[1..])
            .ok()?
            .parse::<usize>()
            .ok()?;
        if buf.len() < pos + len + 2 {
            return None;
        }
        args.push(buf[pos..pos + len].to_vec());
        pos += len + 2;
    }

    buf.drain(..pos);
    Some(args)
}

fn read_line(buf: &[u8], pos: &mut usize) -> Option<Vec<u8>> {
    let start = *pos;
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            let line = buf[start..i].to_vec();
            *pos = i + 2;
            return Some(line);
        }
        i += 1;
    }
    None
}

fn glob_match(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

fn simple_reply(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

fn error_reply(s: &str) -> Vec<u8> {
    format!("-{}\r\n", s).into_bytes()
}

fn integer_reply(n: i64) -> Vec<u8> {
    format!(":{}\r\n", n).into_bytes()
}

fn bulk_reply(bytes: &[u8]) -> Vec<u8> {
    let mut reply = format!("${}\r\n", bytes.len()).into_bytes();
    reply.extend_from_slice(bytes);
    reply.extend_from_slice(b"\r\n");
    reply
}

fn nil_reply() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn subscription_frame(kind: &str, topic: &[u8], count: usize) -> Vec<u8> {
    let mut frame = b"*3\r\n".to_vec();
    frame.extend(bulk_reply(kind.as_bytes()));
    frame.extend(bulk_reply(topic));
    frame.extend(integer_reply(count as i64));
    frame
}

fn message_frame(channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = b"*3\r\n".to_vec();
    frame.extend(bulk_reply(b"message"));
    frame.extend(bulk_reply(channel.as_bytes()));
    frame.extend(bulk_reply(payload));
    frame
}

fn pmessage_frame(pattern: &str, channel: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = b"*4\r\n".to_vec();
    frame.extend(bulk_reply(b"pmessage"));
    frame.extend(bulk_reply(pattern.as_bytes()));
    frame.extend(bulk_reply(channel.as_bytes()));
    frame.extend(bulk_reply(payload));
    frame
}
