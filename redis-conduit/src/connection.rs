//! Connection management and topology detection
//!
//! [`RedisConnection`] is a plain request/response socket used for the
//! handshake and for one-off probes. [`Connection`] is the multiplexed handle
//! the client works with: a background driver task owns the socket, writes
//! requests as they arrive, pairs replies with requests through the
//! [`CommandQueue`], routes pub/sub traffic, probes an idle link and
//! reconnects with backoff when the socket fails.

use crate::commands::Command;
use crate::core::{
    config::{ConnectionConfig, ProtocolVersion, TopologyMode},
    credentials::{Credentials, CredentialsProvider},
    error::{RedisError, RedisResult},
    types::NodeAddr,
    value::RespValue,
};
use crate::pipeline::{CommandQueue, EntryKind, PendingEntry, ReplyBatch, Responder};
use crate::protocol::{ProtocolNegotiation, RespDecoder, RespEncoder};
use crate::pubsub::{classify, Inbound, PubSubKind, SubscriptionRouter};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Type of Redis topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    /// Standalone Redis server
    Standalone,
    /// Redis Cluster
    Cluster,
}

/// What a connection is used for; decides the handshake tail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Standalone server; `SELECT` the configured database
    Standalone,
    /// Cluster primary
    Primary,
    /// Cluster replica; sends `READONLY`
    Replica,
}

/// Lifecycle of a [`Connection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial connect and handshake in progress
    Connecting,
    /// Handshake done, requests flow
    Connected,
    /// Socket lost, waiting for the next attempt
    Reconnecting,
    /// Closed by the caller or out of reconnect attempts
    Closed,
}

/// A connection to a Redis server
pub struct RedisConnection {
    stream: TcpStream,
    read_buffer: BytesMut,
    decoder: RespDecoder,
    addr: NodeAddr,
    operation_timeout: Duration,
    negotiation: ProtocolNegotiation,
}

impl RedisConnection {
    /// Open a TCP connection without any handshake
    pub async fn connect(addr: &NodeAddr, config: &ConnectionConfig) -> RedisResult<Self> {
        debug!("Connecting to Redis at {}", addr);
        let target = (addr.host.as_str(), addr.port);

        let stream = timeout(config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| RedisError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let stream = match config.tcp_keepalive {
            Some(keepalive_duration) => {
                let socket = socket2::Socket::from(stream.into_std()?);
                let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
                socket.set_tcp_keepalive(&keepalive).map_err(|e| {
                    RedisError::Connection(format!("Failed to set TCP keepalive: {}", e))
                })?;
                TcpStream::from_std(socket.into())?
            }
            None => stream,
        };

        Ok(Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
            decoder: RespDecoder::new(ProtocolVersion::Resp2),
            addr: addr.clone(),
            operation_timeout: config.operation_timeout,
            negotiation: ProtocolNegotiation::new(ProtocolVersion::Resp2),
        })
    }

    /// Connect and run the full handshake.
    ///
    /// When the server rejects the credentials and a provider is configured,
    /// the provider is asked to refresh once and the handshake is retried on
    /// a fresh socket.
    pub async fn establish(
        addr: &NodeAddr,
        config: &ConnectionConfig,
        role: NodeRole,
    ) -> RedisResult<Self> {
        let provider = config.credentials();
        let credentials = match provider.as_deref() {
            Some(p) => Some(fetch_credentials(p, false).await?),
            None => None,
        };

        let mut conn = Self::connect(addr, config).await?;
        match conn.handshake(config, role, credentials.as_ref()).await {
            Ok(()) => Ok(conn),
            Err(RedisError::Auth(msg)) if provider.is_some() => {
                warn!("Authentication to {} rejected ({}), refreshing credentials", addr, msg);
                let refreshed = match provider.as_deref() {
                    Some(p) => Some(fetch_credentials(p, true).await?),
                    None => None,
                };
                let mut conn = Self::connect(addr, config).await?;
                conn.handshake(config, role, refreshed.as_ref()).await?;
                Ok(conn)
            }
            Err(e) => Err(e),
        }
    }

    /// Negotiate the protocol, authenticate and apply per-connection settings
    pub async fn handshake(
        &mut self,
        config: &ConnectionConfig,
        role: NodeRole,
        credentials: Option<&Credentials>,
    ) -> RedisResult<()> {
        let credentials = credentials.filter(|c| !c.is_empty());
        let mut authenticated = false;

        if config.protocol_version == ProtocolVersion::Resp3 {
            match self.hello(config, credentials).await {
                Ok(negotiation) => {
                    debug!("Negotiated RESP3 with {}", self.addr);
                    self.negotiation = negotiation;
                    authenticated = true;
                }
                Err(RedisError::Server(msg)) => {
                    info!(
                        "Server {} rejected HELLO 3 ({}), falling back to RESP2",
                        self.addr, msg
                    );
                    self.decoder.set_version(ProtocolVersion::Resp2);
                }
                Err(e) => return Err(e),
            }
        }

        if !authenticated {
            if let Some(credentials) = credentials {
                self.authenticate(credentials).await?;
            }
            if let Some(ref name) = config.client_name {
                self.expect_ok(&["CLIENT", "SETNAME", name.as_str()]).await?;
            }
        }

        match role {
            NodeRole::Standalone if config.database != 0 => {
                let db = config.database.to_string();
                self.expect_ok(&["SELECT", db.as_str()]).await?;
            }
            NodeRole::Replica => self.expect_ok(&["READONLY"]).await?,
            NodeRole::Standalone | NodeRole::Primary => {}
        }
        Ok(())
    }

    async fn hello(
        &mut self,
        config: &ConnectionConfig,
        credentials: Option<&Credentials>,
    ) -> RedisResult<ProtocolNegotiation> {
        let mut args = vec!["HELLO".to_string(), "3".to_string()];
        if let Some(Credentials {
            username,
            password: Some(password),
        }) = credentials
        {
            args.push("AUTH".to_string());
            args.push(username.clone().unwrap_or_else(|| "default".to_string()));
            args.push(password.clone());
        }
        if let Some(ref name) = config.client_name {
            args.push("SETNAME".to_string());
            args.push(name.clone());
        }

        // The reply to HELLO 3 is already a RESP3 map.
        self.decoder.set_version(ProtocolVersion::Resp3);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let reply = self.execute(&args).await?.into_result()?;
        ProtocolNegotiation::from_hello(ProtocolVersion::Resp3, reply)
    }

    /// Authenticate with the Redis server
    async fn authenticate(&mut self, credentials: &Credentials) -> RedisResult<()> {
        debug!("Authenticating with Redis server");
        let Some(ref password) = credentials.password else {
            return Ok(());
        };
        let response = match credentials.username {
            Some(ref user) => self.execute(&["AUTH", user.as_str(), password.as_str()]).await?,
            None => self.execute(&["AUTH", password.as_str()]).await?,
        };

        match response {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            RespValue::Error(e) => Err(RedisError::Auth(e)),
            _ => Err(RedisError::Auth(
                "Unexpected authentication response".to_string(),
            )),
        }
    }

    async fn expect_ok(&mut self, args: &[&str]) -> RedisResult<()> {
        match self.execute(args).await?.into_result()? {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            other => Err(RedisError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    /// Send one command and read its reply frame; error replies are returned as frames
    pub async fn execute(&mut self, args: &[&str]) -> RedisResult<RespValue> {
        let args: Vec<Bytes> = args
            .iter()
            .map(|a| Bytes::copy_from_slice(a.as_bytes()))
            .collect();
        self.execute_args(&args).await
    }

    /// Like [`execute`](Self::execute) for binary arguments
    pub async fn execute_args(&mut self, args: &[Bytes]) -> RedisResult<RespValue> {
        let encoded = RespEncoder::command_bytes(args);

        timeout(self.operation_timeout, self.stream.write_all(&encoded))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(RedisError::Io)?;

        timeout(self.operation_timeout, self.read_response())
            .await
            .map_err(|_| RedisError::Timeout)?
    }

    /// Read a complete RESP response from the connection
    async fn read_response(&mut self) -> RedisResult<RespValue> {
        loop {
            if let Some(value) = self.decoder.decode(&mut self.read_buffer)? {
                return Ok(value);
            }

            let n = self.stream.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(RedisError::Connection(
                    "Connection closed by server".to_string(),
                ));
            }
        }
    }

    /// Detect the topology type of the Redis server
    pub async fn detect_topology(&mut self) -> RedisResult<TopologyType> {
        info!("Detecting Redis topology");

        if let Some(mode) = self.negotiation.server_mode() {
            let topology = if mode == "cluster" {
                TopologyType::Cluster
            } else {
                TopologyType::Standalone
            };
            info!("Server reports {} mode", mode);
            return Ok(topology);
        }

        match self.execute(&["CLUSTER", "INFO"]).await? {
            RespValue::Error(e) => {
                info!("Detected Standalone Redis ({})", e);
                Ok(TopologyType::Standalone)
            }
            reply => {
                let info = reply.as_string()?;
                if info.contains("cluster_enabled:1") || info.contains("cluster_state:") {
                    info!("Detected Redis Cluster");
                    Ok(TopologyType::Cluster)
                } else {
                    info!("Detected Standalone Redis");
                    Ok(TopologyType::Standalone)
                }
            }
        }
    }

    /// Protocol negotiated during the handshake
    pub fn protocol(&self) -> ProtocolVersion {
        self.negotiation.version
    }

    /// Server properties reported by `HELLO`
    pub fn negotiation(&self) -> &ProtocolNegotiation {
        &self.negotiation
    }

    fn into_link(self) -> Link {
        let (reader, writer) = self.stream.into_split();
        Link {
            reader,
            writer,
            inbound: self.read_buffer,
            decoder: self.decoder,
            version: self.negotiation.version,
        }
    }
}

async fn fetch_credentials(
    provider: &dyn CredentialsProvider,
    refresh: bool,
) -> RedisResult<Credentials> {
    let policy = provider.retry_policy();
    let mut attempt = 1;
    loop {
        let result = if refresh {
            provider.refresh().await
        } else {
            provider.credentials().await
        };
        match result {
            Ok(credentials) => return Ok(credentials),
            Err(e) if attempt < policy.max_attempts => {
                debug!("Credentials provider failed (attempt {}): {}", attempt, e);
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Decide whether `config` points at a cluster, probing the first endpoint in auto mode
pub async fn resolve_topology(config: &ConnectionConfig) -> RedisResult<TopologyType> {
    match config.topology_mode {
        TopologyMode::Standalone => Ok(TopologyType::Standalone),
        TopologyMode::Cluster => Ok(TopologyType::Cluster),
        TopologyMode::Auto => {
            let endpoints = config.parse_endpoints();
            let first = endpoints
                .first()
                .ok_or_else(|| RedisError::Config("No endpoints specified".to_string()))?;
            let mut conn = RedisConnection::establish(first, config, NodeRole::Primary).await?;
            conn.detect_topology().await
        }
    }
}

/// Socket halves and decoder state handed to the driver after a handshake
struct Link {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    inbound: BytesMut,
    decoder: RespDecoder,
    version: ProtocolVersion,
}

enum RequestKind {
    Normal,
    PubSub,
}

struct Request {
    payload: Bytes,
    expected: usize,
    kind: RequestKind,
    responder: Responder,
}

enum Message {
    Request(Request),
    Close,
}

/// Why the driver left its serve loop
enum Exit {
    Closed,
    Failed(RedisError),
}

/// Multiplexed, self-healing connection to one node
///
/// Cheap to clone; all clones share the same socket. The driver stops when
/// [`close`](Self::close) is called or the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    addr: NodeAddr,
    tx: mpsc::Sender<Message>,
    state: watch::Receiver<ConnectionState>,
    version: watch::Receiver<ProtocolVersion>,
    operation_timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("protocol", &self.protocol())
            .finish()
    }
}

impl Connection {
    /// Connect, handshake and start the driver.
    ///
    /// `router` receives pub/sub traffic and push frames read on this connection.
    ///
    /// # Errors
    ///
    /// Fails when the first connection attempt or its handshake fails.
    pub async fn connect(
        addr: NodeAddr,
        config: Arc<ConnectionConfig>,
        role: NodeRole,
        router: Option<Arc<SubscriptionRouter>>,
    ) -> RedisResult<Self> {
        let conn = RedisConnection::establish(&addr, &config, role).await?;
        let version = conn.protocol();
        info!("Connected to {} using {}", addr, version);

        let (tx, rx) = mpsc::channel(config.max_in_flight.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let (version_tx, version_rx) = watch::channel(version);
        let operation_timeout = config.operation_timeout;

        let driver = Driver {
            addr: addr.clone(),
            config,
            role,
            rx,
            queue: CommandQueue::new(version),
            offline: VecDeque::new(),
            router,
            carried: BTreeSet::new(),
            pubsub_mode: false,
            credentials_expired: false,
            state_tx,
            version_tx,
        };
        tokio::spawn(driver.run(conn.into_link()));

        Ok(Self {
            addr,
            tx,
            state,
            version: version_rx,
            operation_timeout,
        })
    }

    /// Address of the node
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the driver has stopped for good
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed || self.tx.is_closed()
    }

    /// Protocol negotiated by the most recent handshake
    pub fn protocol(&self) -> ProtocolVersion {
        *self.version.borrow()
    }

    /// Send one command and wait for its reply frame
    pub async fn send(&self, command: &Command) -> RedisResult<(RespValue, ProtocolVersion)> {
        self.send_batch(std::slice::from_ref(command))
            .await?
            .into_single()
    }

    /// Write `commands` back-to-back and wait for all their replies
    pub async fn send_batch(&self, commands: &[Command]) -> RedisResult<ReplyBatch> {
        if commands.is_empty() {
            return Ok(ReplyBatch {
                frames: Vec::new(),
                version: self.protocol(),
            });
        }
        self.request(encode_all(commands), commands.len(), RequestKind::Normal)
            .await
    }

    /// Send a (un)subscribe command and wait for `acks` acknowledgements
    pub(crate) async fn send_pubsub(&self, command: &Command, acks: usize) -> RedisResult<()> {
        let batch = self
            .request(
                encode_all(std::slice::from_ref(command)),
                acks,
                RequestKind::PubSub,
            )
            .await?;
        for frame in batch.frames {
            frame.into_result()?;
        }
        Ok(())
    }

    async fn request(
        &self,
        payload: Bytes,
        expected: usize,
        kind: RequestKind,
    ) -> RedisResult<ReplyBatch> {
        let (responder, reply) = oneshot::channel();
        let message = Message::Request(Request {
            payload,
            expected,
            kind,
            responder,
        });

        let exchange = async {
            self.tx
                .send(message)
                .await
                .map_err(|_| RedisError::Closed(format!("connection to {} is closed", self.addr)))?;
            reply.await.map_err(|_| {
                RedisError::Closed(format!("connection to {} dropped the request", self.addr))
            })?
        };
        timeout(self.operation_timeout, exchange)
            .await
            .map_err(|_| RedisError::Timeout)?
    }

    /// Stop the driver; pending requests fail with [`RedisError::Closed`]
    pub async fn close(&self) {
        let _ = self.tx.send(Message::Close).await;
    }
}

fn encode_all(commands: &[Command]) -> Bytes {
    let mut buf = BytesMut::new();
    for command in commands {
        RespEncoder::encode_command(command.as_args(), &mut buf);
    }
    buf.freeze()
}

struct Driver {
    addr: NodeAddr,
    config: Arc<ConnectionConfig>,
    role: NodeRole,
    rx: mpsc::Receiver<Message>,
    queue: CommandQueue,
    offline: VecDeque<Request>,
    router: Option<Arc<SubscriptionRouter>>,
    /// Subscriptions acknowledged on this socket, replayed after a reconnect
    carried: BTreeSet<(PubSubKind, Bytes)>,
    /// A RESP2 socket with subscriptions only carries pub/sub traffic
    pubsub_mode: bool,
    /// Set when a reply reports NOAUTH or WRONGPASS mid-session
    credentials_expired: bool,
    state_tx: watch::Sender<ConnectionState>,
    version_tx: watch::Sender<ProtocolVersion>,
}

impl Driver {
    async fn run(mut self, mut link: Link) {
        loop {
            let exit = self.serve(&mut link).await;
            let error = match exit {
                Exit::Closed => {
                    debug!("Connection to {} closed", self.addr);
                    self.shutdown("connection closed");
                    return;
                }
                Exit::Failed(error) => error,
            };

            warn!("Connection to {} failed: {}", self.addr, error);
            let message = error.to_string();
            let failed = self
                .queue
                .fail_all(|| RedisError::Connection(message.clone()));
            if failed > 0 {
                debug!("Failed {} pending requests on {}", failed, self.addr);
            }

            match self.reconnect().await {
                Some(next) => link = next,
                None => {
                    self.shutdown("connection lost and not re-established");
                    return;
                }
            }
        }
    }

    fn shutdown(&mut self, reason: &str) {
        self.queue
            .fail_all(|| RedisError::Closed(reason.to_string()));
        for request in self.offline.drain(..) {
            let _ = request
                .responder
                .send(Err(RedisError::Closed(reason.to_string())));
        }
        self.rx.close();
        while let Ok(Message::Request(request)) = self.rx.try_recv() {
            let _ = request
                .responder
                .send(Err(RedisError::Closed(reason.to_string())));
        }
        if let Some(ref router) = self.router {
            let lost: Vec<_> = std::mem::take(&mut self.carried).into_iter().collect();
            router.connection_lost(&lost);
        }
        let _ = self.state_tx.send(ConnectionState::Closed);
    }

    async fn serve(&mut self, link: &mut Link) -> Exit {
        self.queue.set_version(link.version);
        let _ = self.version_tx.send(link.version);
        let _ = self.state_tx.send(ConnectionState::Connected);

        let mut outbound = BytesMut::new();
        self.replay_subscriptions(&mut outbound);
        while let Some(request) = self.offline.pop_front() {
            self.enqueue(request, &mut outbound);
        }

        let mut health = self
            .config
            .health_check_interval
            .filter(|period| !period.is_zero())
            .map(|period| {
                let start = tokio::time::Instant::now() + period;
                let mut interval = tokio::time::interval_at(start, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        loop {
            tokio::select! {
                message = self.rx.recv(), if self.queue.len() < self.config.max_in_flight => {
                    match message {
                        Some(Message::Request(request)) => self.enqueue(request, &mut outbound),
                        Some(Message::Close) | None => {
                            // Flush what is already accepted before closing.
                            if !outbound.is_empty() {
                                let _ = link.writer.write_all(&outbound).await;
                            }
                            return Exit::Closed;
                        }
                    }
                }
                written = link.writer.write_buf(&mut outbound), if !outbound.is_empty() => {
                    match written {
                        Ok(0) => return Exit::Failed(RedisError::Connection("socket closed while writing".to_string())),
                        Ok(_) => {}
                        Err(e) => return Exit::Failed(RedisError::Io(e)),
                    }
                }
                read = link.reader.read_buf(&mut link.inbound) => {
                    match read {
                        Ok(0) => return Exit::Failed(RedisError::Connection("Connection closed by server".to_string())),
                        Ok(_) => {
                            if let Err(e) = self.drain_frames(link) {
                                return Exit::Failed(e);
                            }
                            if self.credentials_expired {
                                self.credentials_expired = false;
                                if let Err(e) = self.reauthenticate(&mut outbound).await {
                                    return Exit::Failed(e);
                                }
                            }
                        }
                        Err(e) => return Exit::Failed(RedisError::Io(e)),
                    }
                }
                () = tick(&mut health) => {
                    if self.queue.has_health_check() {
                        return Exit::Failed(RedisError::Connection("health check timed out".to_string()));
                    }
                    if self.queue.is_empty() {
                        debug!("Sending health check to {}", self.addr);
                        RespEncoder::encode_command(&[Bytes::from_static(b"PING")], &mut outbound);
                        self.queue.push(PendingEntry::new(EntryKind::HealthCheck, 1, None));
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, request: Request, outbound: &mut BytesMut) {
        if request.responder.is_closed() {
            return;
        }
        let kind = match request.kind {
            RequestKind::Normal => EntryKind::Reply,
            RequestKind::PubSub => {
                self.pubsub_mode = true;
                EntryKind::PubSub
            }
        };
        outbound.extend_from_slice(&request.payload);
        self.queue.push(PendingEntry::new(
            kind,
            request.expected,
            Some(request.responder),
        ));
    }

    fn replay_subscriptions(&mut self, outbound: &mut BytesMut) {
        if self.carried.is_empty() {
            return;
        }
        info!(
            "Replaying {} subscriptions on {}",
            self.carried.len(),
            self.addr
        );
        for kind in [PubSubKind::Channel, PubSubKind::Pattern, PubSubKind::Shard] {
            let names: Vec<Bytes> = self
                .carried
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, name)| name.clone())
                .collect();
            if names.is_empty() {
                continue;
            }
            let command = kind.command(true, &names);
            RespEncoder::encode_command(command.as_args(), outbound);
            self.queue
                .push(PendingEntry::new(EntryKind::PubSub, names.len(), None));
            self.pubsub_mode = true;
        }
    }

    fn drain_frames(&mut self, link: &mut Link) -> RedisResult<()> {
        while let Some(frame) = link.decoder.decode(&mut link.inbound)? {
            self.handle_frame(frame, link.version);
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: RespValue, version: ProtocolVersion) {
        match classify(frame, version, self.pubsub_mode) {
            Inbound::Reply(frame) => {
                let answers_request = matches!(
                    self.queue.head_kind(),
                    Some(EntryKind::Reply | EntryKind::PubSub)
                );
                if answers_request && is_auth_failure(&frame) && !self.queue.has_reauth()
                {
                    self.credentials_expired = true;
                }
                self.queue.on_reply(frame);
            }
            Inbound::Message(message) => match self.router {
                Some(ref router) => {
                    router.dispatch(&message);
                }
                None => debug!("Dropping pub/sub message on {}", message.channel),
            },
            Inbound::Ack(ack, frame) => {
                let key = (ack.kind, ack.name.clone());
                if ack.subscribe {
                    self.carried.insert(key);
                } else {
                    self.carried.remove(&key);
                }
                if !self.queue.on_ack(frame) {
                    debug!(
                        "Unsolicited {} acknowledgement for {}",
                        ack.kind.unsubscribe_command(),
                        String::from_utf8_lossy(&ack.name)
                    );
                }
                if ack.remaining == 0 && !self.queue.has_pubsub() {
                    self.pubsub_mode = false;
                }
            }
            Inbound::Push(frame) => match self.router {
                Some(ref router) => router.forward_push(frame),
                None => debug!("Dropping push frame on {}", self.addr),
            },
        }
    }

    /// Fetch refreshed credentials and queue an `AUTH` on the live socket.
    ///
    /// Requests already written ahead of it still see the old session; those
    /// queued afterwards run authenticated.
    async fn reauthenticate(&mut self, outbound: &mut BytesMut) -> RedisResult<()> {
        let Some(provider) = self.config.credentials() else {
            return Ok(());
        };
        info!("Credentials rejected by {}, refreshing", self.addr);
        let credentials = fetch_credentials(provider.as_ref(), true).await?;
        let Some(command) = auth_command(&credentials) else {
            return Ok(());
        };
        RespEncoder::encode_command(command.as_args(), outbound);
        self.queue.push(PendingEntry::new(EntryKind::Reauth, 1, None));
        Ok(())
    }

    /// Park or reject a request that arrives while there is no socket
    fn hold(&mut self, request: Request) {
        if self.config.queue_while_disconnected
            && self.offline.len() < self.config.max_offline_commands
        {
            self.offline.push_back(request);
        } else {
            let reason = if self.config.queue_while_disconnected {
                "offline queue is full"
            } else {
                "not connected"
            };
            let _ = request.responder.send(Err(RedisError::Connection(format!(
                "{}: {}",
                self.addr, reason
            ))));
        }
    }

    async fn reconnect(&mut self) -> Option<Link> {
        let mut attempt = 0;
        loop {
            if !self.config.reconnect.allows(attempt) {
                warn!(
                    "Giving up on {} after {} reconnect attempts",
                    self.addr, attempt
                );
                return None;
            }
            let _ = self.state_tx.send(ConnectionState::Reconnecting);
            let delay = self.config.reconnect.delay_for(attempt);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.addr,
                delay,
                attempt + 1
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    message = self.rx.recv() => match message {
                        Some(Message::Request(request)) => self.hold(request),
                        Some(Message::Close) | None => return None,
                    }
                }
            }

            match RedisConnection::establish(&self.addr, &self.config, self.role).await {
                Ok(conn) => {
                    info!("Reconnected to {} using {}", self.addr, conn.protocol());
                    self.pubsub_mode = false;
                    return Some(conn.into_link());
                }
                Err(e) => {
                    warn!("Reconnect to {} failed: {}", self.addr, e);
                    attempt += 1;
                }
            }
        }
    }
}

fn is_auth_failure(frame: &RespValue) -> bool {
    match frame {
        RespValue::Error(msg) => {
            matches!(RedisError::from_server_message(msg), RedisError::Auth(_))
        }
        _ => false,
    }
}

fn auth_command(credentials: &Credentials) -> Option<Command> {
    let password = credentials.password.as_deref()?;
    let command = Command::new("AUTH");
    Some(match credentials.username.as_deref() {
        Some(user) => command.arg(user).arg(password),
        None => command.arg(password),
    })
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forced_topology_skips_probe() {
        let config = ConnectionConfig::new("redis://127.0.0.1:1")
            .with_topology_mode(TopologyMode::Standalone);
        assert_eq!(
            resolve_topology(&config).await.unwrap(),
            TopologyType::Standalone
        );

        let config = config.with_topology_mode(TopologyMode::Cluster);
        assert_eq!(
            resolve_topology(&config).await.unwrap(),
            TopologyType::Cluster
        );
    }

    #[test]
    fn test_encode_all_concatenates() {
        let commands = [Command::new("MULTI"), Command::new("EXEC")];
        assert_eq!(
            &encode_all(&commands)[..],
            b"*1\r\n$5\r\nMULTI\r\n*1\r\n$4\r\nEXEC\r\n"
        );
    }

    #[test]
    fn test_auth_failure_detection() {
        assert!(is_auth_failure(&RespValue::Error(
            "NOAUTH Authentication required.".into()
        )));
        assert!(is_auth_failure(&RespValue::Error(
            "WRONGPASS invalid username-password pair".into()
        )));
        assert!(!is_auth_failure(&RespValue::Error("ERR unknown command".into())));
        assert!(!is_auth_failure(&RespValue::SimpleString("NOAUTH".into())));
    }

    #[test]
    fn test_auth_command_args() {
        let command = auth_command(&Credentials::user("app", "s3cret")).unwrap();
        assert_eq!(command.as_args(), &["AUTH", "app", "s3cret"].map(Bytes::from));
        let command = auth_command(&Credentials::password("s3cret")).unwrap();
        assert_eq!(command.as_args(), &["AUTH", "s3cret"].map(Bytes::from));
        assert!(auth_command(&Credentials::default()).is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = ConnectionConfig::new("redis://127.0.0.1:1")
            .with_connect_timeout(Duration::from_millis(200));
        let result = RedisConnection::connect(&NodeAddr::new("127.0.0.1", 1), &config).await;
        assert!(result.is_err());
    }
}
