//! In-process RESP server for integration tests
//!
//! Speaks enough of the Redis protocol to drive the client: handshake,
//! strings, hashes, transactions and pub/sub, over RESP2 or RESP3. A hook can
//! intercept any command to script redirects, silence or disconnects.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use redis_conduit::protocol::{RespDecoder, RespEncoder};
use redis_conduit::{NodeAddr, ProtocolVersion, RespValue};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

/// What the server does with one command
pub enum Action {
    Reply(RespValue),
    Many(Vec<RespValue>),
    /// Stall this connection, then answer
    Delayed(Duration, RespValue),
    /// Read the command, never answer
    Silent,
    /// Drop the connection
    Close,
}

pub type Hook = Arc<dyn Fn(&mut Session, &[String]) -> Option<Action> + Send + Sync>;

/// Wrap a closure as a hook; `None` from it falls through to the built-in handling
pub fn hook(
    f: impl Fn(&mut Session, &[String]) -> Option<Action> + Send + Sync + 'static,
) -> Option<Hook> {
    Some(Arc::new(f))
}

#[derive(Clone, Default)]
pub struct Options {
    /// Accept `HELLO 3`
    pub resp3: bool,
    /// Write replies a few bytes at a time
    pub fragmented: bool,
    /// Require AUTH with this password
    pub password: Option<String>,
    /// `mode` reported by HELLO
    pub cluster_mode: bool,
    pub hook: Option<Hook>,
}

pub struct Session {
    pub id: usize,
    pub version: ProtocolVersion,
    pub authenticated: bool,
    pub asking: bool,
    pub readonly: bool,
    queued: Option<Vec<Vec<String>>>,
    multi_failed: bool,
}

struct Peer {
    tx: mpsc::UnboundedSender<Bytes>,
    version: ProtocolVersion,
    subscriptions: BTreeSet<(&'static str, String)>,
}

#[derive(Default)]
struct Store {
    strings: HashMap<String, String>,
    hashes: HashMap<String, Vec<(String, String)>>,
    log: Vec<Vec<String>>,
    peers: HashMap<usize, Peer>,
    tasks: Vec<AbortHandle>,
    next_id: usize,
}

pub struct MockServer {
    pub addr: NodeAddr,
    store: Arc<Mutex<Store>>,
    accept: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(options: Options) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = Arc::new(Mutex::new(Store::default()));
        let options = Arc::new(options);

        let accept_store = Arc::clone(&store);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let id = {
                    let mut store = accept_store.lock().unwrap();
                    store.next_id += 1;
                    store.next_id
                };
                let task = tokio::spawn(serve(
                    stream,
                    Arc::clone(&accept_store),
                    Arc::clone(&options),
                    id,
                ));
                accept_store.lock().unwrap().tasks.push(task.abort_handle());
            }
        });

        Self {
            addr: NodeAddr::new("127.0.0.1", port),
            store,
            accept,
        }
    }

    pub async fn standalone() -> Self {
        Self::start(Options::default()).await
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Every command received, across connections
    pub fn log(&self) -> Vec<Vec<String>> {
        self.store.lock().unwrap().log.clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.log()
            .iter()
            .filter(|args| args[0].eq_ignore_ascii_case(name))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.store.lock().unwrap().peers.len()
    }

    pub fn set_string(&self, key: &str, value: &str) {
        self.store
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), value.to_string());
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().strings.get(key).cloned()
    }

    /// Drop every open connection; the listener keeps accepting
    pub fn kill_connections(&self) {
        let mut store = self.store.lock().unwrap();
        for task in store.tasks.drain(..) {
            task.abort();
        }
        store.peers.clear();
    }

    /// Wait until `predicate` holds, polling the server state
    pub async fn wait_for(&self, predicate: impl Fn(&Self) -> bool) {
        for _ in 0..200 {
            if predicate(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept.abort();
        self.kill_connections();
    }
}

async fn serve(stream: TcpStream, store: Arc<Mutex<Store>>, options: Arc<Options>, id: usize) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let fragmented = options.fragmented;
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if fragmented {
                for chunk in bytes.chunks(3) {
                    if writer.write_all(chunk).await.is_err() {
                        return;
                    }
                    let _ = writer.flush().await;
                    tokio::task::yield_now().await;
                }
            } else if writer.write_all(&bytes).await.is_err() {
                return;
            }
        }
    });

    {
        let mut guard = store.lock().unwrap();
        guard.tasks.push(writer_task.abort_handle());
        guard.peers.insert(
            id,
            Peer {
                tx: tx.clone(),
                version: ProtocolVersion::Resp2,
                subscriptions: BTreeSet::new(),
            },
        );
    }

    let mut session = Session {
        id,
        version: ProtocolVersion::Resp2,
        authenticated: options.password.is_none(),
        asking: false,
        readonly: false,
        queued: None,
        multi_failed: false,
    };
    let mut decoder = RespDecoder::new(ProtocolVersion::Resp2);
    let mut buf = BytesMut::new();

    'outer: loop {
        loop {
            let frame = match decoder.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => break 'outer,
            };
            let args = to_strings(frame);
            if args.is_empty() {
                continue;
            }
            let replies = match handle(&mut session, &args, &store, &options) {
                Action::Reply(reply) => vec![reply],
                Action::Delayed(delay, reply) => {
                    tokio::time::sleep(delay).await;
                    vec![reply]
                }
                Action::Many(replies) => replies,
                Action::Silent => Vec::new(),
                Action::Close => break 'outer,
            };
            let mut out = BytesMut::new();
            for reply in &replies {
                RespEncoder::encode(reply, session.version, &mut out);
            }
            if !out.is_empty() && tx.send(out.freeze()).is_err() {
                break 'outer;
            }
        }
        match reader.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    store.lock().unwrap().peers.remove(&id);
    writer_task.abort();
}

fn to_strings(frame: RespValue) -> Vec<String> {
    match frame {
        RespValue::Array(items) => items
            .into_iter()
            .map(|item| match item {
                RespValue::BulkString(b) => String::from_utf8_lossy(&b).into_owned(),
                other => other.as_string().unwrap_or_default(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

fn bulk(s: &str) -> RespValue {
    RespValue::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

fn err(msg: &str) -> RespValue {
    RespValue::Error(msg.to_string())
}

fn map(version: ProtocolVersion, pairs: Vec<(RespValue, RespValue)>) -> RespValue {
    match version {
        ProtocolVersion::Resp3 => RespValue::Map(pairs),
        ProtocolVersion::Resp2 => {
            RespValue::Array(pairs.into_iter().flat_map(|(k, v)| [k, v]).collect())
        }
    }
}

fn push(version: ProtocolVersion, items: Vec<RespValue>) -> RespValue {
    match version {
        ProtocolVersion::Resp3 => RespValue::Push(items),
        ProtocolVersion::Resp2 => RespValue::Array(items),
    }
}

/// Glob match supporting `*` and `?`
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

const DATA_COMMANDS: &[&str] = &[
    "GET", "SET", "MGET", "DEL", "EXISTS", "INCR", "INCRBY", "DECR", "EXPIRE", "TTL", "HSET",
    "HGET", "HGETALL", "HLEN", "HDEL", "ECHO", "PING", "ZUNIONSTORE", "DBSIZE", "PUBLISH",
];

fn handle(
    session: &mut Session,
    args: &[String],
    store: &Arc<Mutex<Store>>,
    options: &Options,
) -> Action {
    store.lock().unwrap().log.push(args.to_vec());

    if let Some(hook) = &options.hook {
        if let Some(action) = hook(session, args) {
            return action;
        }
    }

    let name = args[0].to_ascii_uppercase();
    if !session.authenticated && !matches!(name.as_str(), "AUTH" | "HELLO") {
        return Action::Reply(err("NOAUTH Authentication required."));
    }

    if session.queued.is_some() && !matches!(name.as_str(), "EXEC" | "DISCARD" | "MULTI") {
        if DATA_COMMANDS.contains(&name.as_str()) {
            if let Some(queued) = session.queued.as_mut() {
                queued.push(args.to_vec());
            }
            return Action::Reply(RespValue::SimpleString("QUEUED".to_string()));
        }
        session.multi_failed = true;
        return Action::Reply(err(&format!("ERR unknown command '{}'", args[0])));
    }

    match name.as_str() {
        "MULTI" => {
            session.queued = Some(Vec::new());
            session.multi_failed = false;
            Action::Reply(ok())
        }
        "DISCARD" => {
            session.queued = None;
            Action::Reply(ok())
        }
        "EXEC" => {
            let Some(queued) = session.queued.take() else {
                return Action::Reply(err("ERR EXEC without MULTI"));
            };
            if session.multi_failed {
                return Action::Reply(err(
                    "EXECABORT Transaction discarded because of previous errors.",
                ));
            }
            let results = queued
                .iter()
                .map(|args| execute(session, args, store, options))
                .collect();
            Action::Reply(RespValue::Array(results))
        }
        _ => match pubsub(session, &name, args, store) {
            Some(action) => action,
            None => Action::Reply(execute(session, args, store, options)),
        },
    }
}

fn pubsub(
    session: &mut Session,
    name: &str,
    args: &[String],
    store: &Arc<Mutex<Store>>,
) -> Option<Action> {
    let (kind, subscribe) = match name {
        "SUBSCRIBE" => ("subscribe", true),
        "UNSUBSCRIBE" => ("subscribe", false),
        "PSUBSCRIBE" => ("psubscribe", true),
        "PUNSUBSCRIBE" => ("psubscribe", false),
        "SSUBSCRIBE" => ("ssubscribe", true),
        "SUNSUBSCRIBE" => ("ssubscribe", false),
        _ => return None,
    };
    let ack_name = if subscribe {
        kind.to_string()
    } else {
        format!("un{}", kind)
    };

    let mut guard = store.lock().unwrap();
    let Some(peer) = guard.peers.get_mut(&session.id) else {
        return Some(Action::Close);
    };
    let mut names: Vec<String> = args[1..].to_vec();
    if !subscribe && names.is_empty() {
        names = peer
            .subscriptions
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.clone())
            .collect();
    }

    let mut acks = Vec::new();
    if names.is_empty() {
        acks.push(push(
            session.version,
            vec![bulk(&ack_name), RespValue::Null, RespValue::Integer(0)],
        ));
    }
    for channel in names {
        if subscribe {
            peer.subscriptions.insert((kind, channel.clone()));
        } else {
            peer.subscriptions.remove(&(kind, channel.clone()));
        }
        acks.push(push(
            session.version,
            vec![
                bulk(&ack_name),
                bulk(&channel),
                RespValue::Integer(peer.subscriptions.len() as i64),
            ],
        ));
    }
    Some(Action::Many(acks))
}

fn publish(store: &Arc<Mutex<Store>>, kind: &str, channel: &str, message: &str) -> i64 {
    let guard = store.lock().unwrap();
    let mut receivers = 0;
    for peer in guard.peers.values() {
        for (sub_kind, name) in &peer.subscriptions {
            let frame = match (*sub_kind, kind) {
                ("subscribe", "message") if name == channel => {
                    vec![bulk("message"), bulk(channel), bulk(message)]
                }
                ("ssubscribe", "smessage") if name == channel => {
                    vec![bulk("smessage"), bulk(channel), bulk(message)]
                }
                ("psubscribe", "message") if glob_match(name.as_bytes(), channel.as_bytes()) => {
                    vec![bulk("pmessage"), bulk(name), bulk(channel), bulk(message)]
                }
                _ => continue,
            };
            let mut out = BytesMut::new();
            RespEncoder::encode(&push(peer.version, frame), peer.version, &mut out);
            if peer.tx.send(out.freeze()).is_ok() {
                receivers += 1;
            }
        }
    }
    receivers
}

fn execute(
    session: &mut Session,
    args: &[String],
    store: &Arc<Mutex<Store>>,
    options: &Options,
) -> RespValue {
    let name = args[0].to_ascii_uppercase();
    let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

    match name.as_str() {
        "HELLO" => {
            if !options.resp3 {
                return err("ERR unknown command 'HELLO', with args beginning with: '3'");
            }
            if let Some(pos) = args.iter().position(|a| a.eq_ignore_ascii_case("AUTH")) {
                if options.password.as_deref() != args.get(pos + 2).map(String::as_str) {
                    return err("WRONGPASS invalid username-password pair or user is disabled.");
                }
                session.authenticated = true;
            }
            if !session.authenticated {
                return err("NOAUTH HELLO must be called with the client already authenticated");
            }
            session.version = ProtocolVersion::Resp3;
            if let Some(peer) = store.lock().unwrap().peers.get_mut(&session.id) {
                peer.version = ProtocolVersion::Resp3;
            }
            let mode = if options.cluster_mode {
                "cluster"
            } else {
                "standalone"
            };
            map(
                session.version,
                vec![
                    (bulk("server"), bulk("redis")),
                    (bulk("version"), bulk("7.2.0")),
                    (bulk("proto"), RespValue::Integer(3)),
                    (bulk("id"), RespValue::Integer(session.id as i64)),
                    (bulk("mode"), bulk(mode)),
                    (bulk("role"), bulk("master")),
                    (bulk("modules"), RespValue::Array(Vec::new())),
                ],
            )
        }
        "AUTH" => {
            if options.password.as_deref() == args.last().map(String::as_str) {
                session.authenticated = true;
                ok()
            } else {
                err("WRONGPASS invalid username-password pair or user is disabled.")
            }
        }
        "CLIENT" | "SELECT" | "QUIT" => ok(),
        "READONLY" => {
            session.readonly = true;
            ok()
        }
        "ASKING" => {
            session.asking = true;
            ok()
        }
        "PING" if args.len() > 1 => bulk(&arg(1)),
        "PING" => RespValue::SimpleString("PONG".to_string()),
        "ECHO" => bulk(&arg(1)),
        "CLUSTER" => err("ERR This instance has cluster support disabled"),
        "INFO" => bulk("# Server\r\nredis_version:7.2.0\r\n"),
        "MEMORY" => map(
            session.version,
            vec![
                (bulk("peak.allocated"), RespValue::Integer(1_048_576)),
                (bulk("keys.count"), RespValue::Integer(2)),
            ],
        ),
        "PUBLISH" => RespValue::Integer(publish(store, "message", &arg(1), &arg(2))),
        "SPUBLISH" => RespValue::Integer(publish(store, "smessage", &arg(1), &arg(2))),
        _ => data(session, &name, args, store),
    }
}

fn data(session: &Session, name: &str, args: &[String], store: &Arc<Mutex<Store>>) -> RespValue {
    let mut store = store.lock().unwrap();
    let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

    match name {
        "SET" => {
            store.strings.insert(arg(1), arg(2));
            ok()
        }
        "GET" => store
            .strings
            .get(&arg(1))
            .map_or(RespValue::Null, |v| bulk(v)),
        "MGET" => RespValue::Array(
            args[1..]
                .iter()
                .map(|k| store.strings.get(k).map_or(RespValue::Null, |v| bulk(v)))
                .collect(),
        ),
        "DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if store.strings.remove(key).is_some() || store.hashes.remove(key).is_some() {
                    removed += 1;
                }
            }
            RespValue::Integer(removed)
        }
        "EXISTS" => RespValue::Integer(
            args[1..]
                .iter()
                .filter(|k| store.strings.contains_key(*k) || store.hashes.contains_key(*k))
                .count() as i64,
        ),
        "INCR" | "INCRBY" | "DECR" => {
            let delta = match name {
                "INCR" => 1,
                "DECR" => -1,
                _ => match arg(2).parse::<i64>() {
                    Ok(d) => d,
                    Err(_) => return err("ERR value is not an integer or out of range"),
                },
            };
            let current = store.strings.get(&arg(1)).cloned().unwrap_or_else(|| "0".into());
            let Ok(current) = current.parse::<i64>() else {
                return err("ERR value is not an integer or out of range");
            };
            let next = current + delta;
            store.strings.insert(arg(1), next.to_string());
            RespValue::Integer(next)
        }
        "EXPIRE" => RespValue::Integer(i64::from(store.strings.contains_key(&arg(1)))),
        "TTL" => RespValue::Integer(if store.strings.contains_key(&arg(1)) {
            -1
        } else {
            -2
        }),
        "DBSIZE" => RespValue::Integer((store.strings.len() + store.hashes.len()) as i64),
        "HSET" => {
            let hash = store.hashes.entry(arg(1)).or_default();
            let mut added = 0;
            for pair in args[2..].chunks(2) {
                let (field, value) = (pair[0].clone(), pair.get(1).cloned().unwrap_or_default());
                match hash.iter_mut().find(|(f, _)| *f == field) {
                    Some(existing) => existing.1 = value,
                    None => {
                        hash.push((field, value));
                        added += 1;
                    }
                }
            }
            RespValue::Integer(added)
        }
        "HGET" => store
            .hashes
            .get(&arg(1))
            .and_then(|h| h.iter().find(|(f, _)| *f == arg(2)))
            .map_or(RespValue::Null, |(_, v)| bulk(v)),
        "HLEN" => RespValue::Integer(store.hashes.get(&arg(1)).map_or(0, Vec::len) as i64),
        "HGETALL" => {
            let pairs = store
                .hashes
                .get(&arg(1))
                .map(|h| h.iter().map(|(f, v)| (bulk(f), bulk(v))).collect())
                .unwrap_or_default();
            map(session.version, pairs)
        }
        "ZUNIONSTORE" => RespValue::Integer(0),
        _ => err(&format!("ERR unknown command '{}'", args[0])),
    }
}

/// Client configuration for `server` with background probes disabled
pub fn config(server: &MockServer) -> redis_conduit::ConnectionConfig {
    redis_conduit::ConnectionConfig::new(server.url())
        .with_topology_mode(redis_conduit::TopologyMode::Standalone)
        .with_health_check_interval(None)
        .with_operation_timeout(Duration::from_secs(5))
}

/// Install a log subscriber once; controlled by `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
