//! High-level Redis client
//!
//! This module provides the main `Client` interface for interacting with Redis.

use crate::cluster::{ClusterClient, SlotMap};
use crate::commands::{self, Command, IntoArg, TypedCommand};
use crate::connection::{resolve_topology, Connection, ConnectionState, NodeRole, TopologyType};
use crate::core::{
    config::{ConnectionConfig, ProtocolVersion},
    error::{RedisError, RedisResult},
    mapping::TypeMapping,
    types::{NodeAddr, RedisValue},
    value::RespValue,
};
use crate::pipeline::{Pipeline, PipelineExecutor, ReplyBatch};
use crate::pubsub::{PubSubConnection, PubSubKind, Subscriber, SubscriptionRouter};
use crate::transaction::{Transaction, TransactionExecutor};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, info};

enum Backend {
    Standalone(Connection),
    Cluster(Arc<ClusterClient>),
}

/// State shared by every clone of a [`Client`] and every view derived from it
struct ClientInner {
    config: Arc<ConnectionConfig>,
    backend: Backend,
    router: Arc<SubscriptionRouter>,
    /// Dedicated subscription socket for a RESP2 standalone server
    pubsub: OnceCell<Connection>,
}

impl ClientInner {
    /// Fail before any I/O when `command` is unstable under the requested protocol
    fn check_command(&self, command: &Command) -> RedisResult<()> {
        match commands::spec_for(command) {
            Some(spec) => commands::check_stability(
                spec,
                self.config.protocol_version,
                self.config.unstable_resp3,
            ),
            None => Ok(()),
        }
    }

    async fn send(&self, command: &Command) -> RedisResult<(RespValue, ProtocolVersion)> {
        match &self.backend {
            Backend::Standalone(conn) => conn.send(command).await,
            Backend::Cluster(cluster) => cluster.send(command).await,
        }
    }

    /// Send commands as one unit on one connection
    async fn dispatch(&self, commands: &[Command]) -> RedisResult<ReplyBatch> {
        match &self.backend {
            Backend::Standalone(conn) => conn.send_batch(commands).await,
            Backend::Cluster(cluster) => cluster.dispatch(commands).await,
        }
    }

    async fn execute<O>(&self, mapping: TypeMapping, command: TypedCommand<O>) -> RedisResult<O> {
        command.check_stability(self.config.protocol_version, self.config.unstable_resp3)?;
        let (command, shape, mapping_override) = command.into_parts();
        let (frame, version) = self.send(&command).await?;
        shape.apply(version, frame, &mapping_override.unwrap_or(mapping))
    }

    async fn call(&self, mapping: TypeMapping, command: Command) -> RedisResult<RedisValue> {
        self.check_command(&command)?;
        let (frame, _) = self.send(&command).await?;
        mapping.apply(frame)
    }

    async fn pubsub_connection(
        &self,
        kind: PubSubKind,
        command: &Command,
    ) -> RedisResult<Connection> {
        match &self.backend {
            Backend::Standalone(conn) if conn.protocol() == ProtocolVersion::Resp3 => {
                Ok(conn.clone())
            }
            Backend::Standalone(conn) => self
                .pubsub
                .get_or_try_init(|| {
                    debug!("Opening dedicated pub/sub connection to {}", conn.addr());
                    Connection::connect(
                        conn.addr().clone(),
                        Arc::clone(&self.config),
                        NodeRole::Standalone,
                        Some(Arc::clone(&self.router)),
                    )
                })
                .await
                .cloned(),
            Backend::Cluster(cluster) => cluster.pubsub_connection(kind, command).await,
        }
    }
}

#[async_trait]
impl PipelineExecutor for ClientInner {
    async fn execute_pipeline(
        &self,
        commands: Vec<Command>,
    ) -> RedisResult<Vec<RedisResult<(RespValue, ProtocolVersion)>>> {
        for command in &commands {
            self.check_command(command)?;
        }
        match &self.backend {
            Backend::Standalone(conn) => {
                let batch = conn.send_batch(&commands).await?;
                let version = batch.version;
                Ok(batch.frames.into_iter().map(|f| Ok((f, version))).collect())
            }
            // Each command goes to its own slot owner; same-node commands
            // keep their relative order on that node's connection
            Backend::Cluster(cluster) => {
                Ok(join_all(commands.iter().map(|command| cluster.send(command))).await)
            }
        }
    }
}

#[async_trait]
impl TransactionExecutor for ClientInner {
    async fn execute_transaction(&self, commands: Vec<Command>) -> RedisResult<ReplyBatch> {
        for command in &commands {
            self.check_command(command)?;
        }
        self.dispatch(&commands).await
    }
}

#[async_trait]
impl PubSubConnection for ClientInner {
    async fn send_pubsub(
        &self,
        kind: PubSubKind,
        command: Command,
        acks: usize,
    ) -> RedisResult<()> {
        let conn = self.pubsub_connection(kind, &command).await?;
        conn.send_pubsub(&command, acks).await
    }
}

/// Typed command execution shared by [`Client`] and [`ClientView`]
///
/// Every convenience method is a thin wrapper over
/// [`execute`](Self::execute) with a declaration from [`commands`].
#[async_trait]
pub trait Commands: Send + Sync {
    /// Send a declared command and shape its reply
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::UnstableCommand`] before any I/O for an unstable
    /// command under RESP3 without the opt-in, the server's error reply, or
    /// a connection failure.
    async fn execute<O: Send + 'static>(&self, command: TypedCommand<O>) -> RedisResult<O>;

    /// Send a raw command, e.g. `["SET", "k", "v"]`, and map the reply
    async fn call<I, A>(&self, args: I) -> RedisResult<RedisValue>
    where
        I: IntoIterator<Item = A> + Send,
        A: IntoArg + Send;

    /// Get the value of a key
    async fn get<K: IntoArg + Send>(&self, key: K) -> RedisResult<Option<String>> {
        self.execute(commands::get(key)).await
    }

    /// Get the values of several keys
    async fn mget<I, K>(&self, keys: I) -> RedisResult<Vec<Option<String>>>
    where
        I: IntoIterator<Item = K> + Send,
        K: IntoArg + Send,
    {
        self.execute(commands::mget(keys)).await
    }

    /// Set a key to a value
    async fn set<K, V>(&self, key: K, value: V) -> RedisResult<()>
    where
        K: IntoArg + Send,
        V: IntoArg + Send,
    {
        self.execute(commands::set(key, value)).await
    }

    /// Set a key with an expiration
    async fn set_ex<K, V>(&self, key: K, value: V, ttl: Duration) -> RedisResult<()>
    where
        K: IntoArg + Send,
        V: IntoArg + Send,
    {
        self.execute(commands::set_ex(key, value, ttl)).await
    }

    /// Delete keys
    async fn del<I, K>(&self, keys: I) -> RedisResult<i64>
    where
        I: IntoIterator<Item = K> + Send,
        K: IntoArg + Send,
    {
        self.execute(commands::del(keys)).await
    }

    /// Count existing keys
    async fn exists<I, K>(&self, keys: I) -> RedisResult<i64>
    where
        I: IntoIterator<Item = K> + Send,
        K: IntoArg + Send,
    {
        self.execute(commands::exists(keys)).await
    }

    /// Increment a counter by one
    async fn incr<K: IntoArg + Send>(&self, key: K) -> RedisResult<i64> {
        self.execute(commands::incr(key)).await
    }

    /// Increment a counter
    async fn incr_by<K: IntoArg + Send>(&self, key: K, increment: i64) -> RedisResult<i64> {
        self.execute(commands::incr_by(key, increment)).await
    }

    /// Decrement a counter by one
    async fn decr<K: IntoArg + Send>(&self, key: K) -> RedisResult<i64> {
        self.execute(commands::decr(key)).await
    }

    /// Set a timeout on a key
    async fn expire<K: IntoArg + Send>(&self, key: K, ttl: Duration) -> RedisResult<bool> {
        self.execute(commands::expire(key, ttl)).await
    }

    /// Remaining time to live in seconds, -1 without expiry, -2 when missing
    async fn ttl<K: IntoArg + Send>(&self, key: K) -> RedisResult<i64> {
        self.execute(commands::ttl(key)).await
    }

    /// Get a hash field
    async fn hget<K, F>(&self, key: K, field: F) -> RedisResult<Option<String>>
    where
        K: IntoArg + Send,
        F: IntoArg + Send,
    {
        self.execute(commands::hget(key, field)).await
    }

    /// Set hash fields
    async fn hset<K, I, F, V>(&self, key: K, pairs: I) -> RedisResult<i64>
    where
        K: IntoArg + Send,
        I: IntoIterator<Item = (F, V)> + Send,
        F: IntoArg + Send,
        V: IntoArg + Send,
    {
        self.execute(commands::hset(key, pairs)).await
    }

    /// Delete hash fields
    async fn hdel<K, I, F>(&self, key: K, fields: I) -> RedisResult<i64>
    where
        K: IntoArg + Send,
        I: IntoIterator<Item = F> + Send,
        F: IntoArg + Send,
    {
        self.execute(commands::hdel(key, fields)).await
    }

    /// All fields of a hash, shaped by the active type mapping
    async fn hgetall<K: IntoArg + Send>(&self, key: K) -> RedisResult<RedisValue> {
        self.execute(commands::hgetall(key)).await
    }

    /// Store a weighted union of sorted sets
    async fn zunionstore<D, I, K>(
        &self,
        destination: D,
        keys: I,
        weights: Option<&[f64]>,
    ) -> RedisResult<i64>
    where
        D: IntoArg + Send,
        I: IntoIterator<Item = K> + Send,
        K: IntoArg + Send,
    {
        self.execute(commands::zunionstore(destination, keys, weights))
            .await
    }

    /// Ping the server
    async fn ping(&self) -> RedisResult<String> {
        self.execute(commands::ping()).await
    }

    /// Publish to a channel
    async fn publish<C, M>(&self, channel: C, message: M) -> RedisResult<i64>
    where
        C: IntoArg + Send,
        M: IntoArg + Send,
    {
        self.execute(commands::publish(channel, message)).await
    }

    /// Publish to a shard channel
    async fn spublish<C, M>(&self, channel: C, message: M) -> RedisResult<i64>
    where
        C: IntoArg + Send,
        M: IntoArg + Send,
    {
        self.execute(commands::spublish(channel, message)).await
    }
}

/// High-level Redis client
///
/// Automatically handles:
/// - Topology detection (Standalone vs Cluster)
/// - MOVED and ASK redirects in cluster mode
/// - One multiplexed, pipelined connection per node
/// - Reconnection with exponential backoff
///
/// Clones share the same connections.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect to Redis with the given configuration
    ///
    /// This will automatically detect whether you're connecting to a
    /// standalone Redis server or a Redis Cluster.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use redis_conduit::{Client, ConnectionConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = ConnectionConfig::new("redis://localhost:6379");
    ///     let client = Client::connect(config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        config.validate()?;
        info!("Connecting to Redis...");

        let config = Arc::new(config);
        let router = Arc::new(SubscriptionRouter::new());
        let backend = match resolve_topology(&config).await? {
            TopologyType::Standalone => {
                info!("Connecting to Standalone Redis");
                let addr = config
                    .parse_endpoints()
                    .into_iter()
                    .next()
                    .ok_or_else(|| RedisError::Config("No endpoints specified".to_string()))?;
                Backend::Standalone(
                    Connection::connect(
                        addr,
                        Arc::clone(&config),
                        NodeRole::Standalone,
                        Some(Arc::clone(&router)),
                    )
                    .await?,
                )
            }
            TopologyType::Cluster => {
                info!("Connecting to Redis Cluster");
                Backend::Cluster(
                    ClusterClient::connect(Arc::clone(&config), Arc::clone(&router)).await?,
                )
            }
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                router,
                pubsub: OnceCell::new(),
            }),
        })
    }

    /// Detected topology
    #[must_use]
    pub fn topology_type(&self) -> TopologyType {
        match self.inner.backend {
            Backend::Standalone(_) => TopologyType::Standalone,
            Backend::Cluster(_) => TopologyType::Cluster,
        }
    }

    /// Configuration the client was built with
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Protocol negotiated with the server, which may be RESP2 after a fallback
    pub async fn protocol(&self) -> ProtocolVersion {
        match &self.inner.backend {
            Backend::Standalone(conn) => conn.protocol(),
            Backend::Cluster(cluster) => cluster
                .protocol()
                .await
                .unwrap_or(self.inner.config.protocol_version),
        }
    }

    /// Observe the standalone connection's lifecycle; `None` in cluster mode
    #[must_use]
    pub fn connection_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        match &self.inner.backend {
            Backend::Standalone(conn) => Some(conn.watch_state()),
            Backend::Cluster(_) => None,
        }
    }

    /// Current slot map; `None` for a standalone server
    #[must_use]
    pub fn slot_map(&self) -> Option<Arc<SlotMap>> {
        match &self.inner.backend {
            Backend::Standalone(_) => None,
            Backend::Cluster(cluster) => Some(cluster.slot_map()),
        }
    }

    /// Re-query the cluster's slot layout; a no-op for a standalone server
    pub async fn refresh_topology(&self) -> RedisResult<()> {
        match &self.inner.backend {
            Backend::Standalone(_) => Ok(()),
            Backend::Cluster(cluster) => cluster.refresh_slots().await,
        }
    }

    /// A view sharing this client's connections but shaping replies with `mapping`
    ///
    /// The client itself keeps its own mapping.
    #[must_use]
    pub fn with_type_mapping(&self, mapping: TypeMapping) -> ClientView<'_> {
        ClientView {
            client: self,
            mapping,
        }
    }

    /// Create a new pipeline for batching commands
    ///
    /// Pipeline allows you to send multiple commands to Redis in a single
    /// network round-trip, which can significantly improve performance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use redis_conduit::{Client, ConnectionConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = ConnectionConfig::new("redis://localhost:6379");
    /// let client = Client::connect(config).await?;
    ///
    /// let mut pipeline = client.pipeline();
    /// pipeline.set("key1", "value1");
    /// pipeline.set("key2", "value2");
    /// pipeline.get("key1");
    ///
    /// let results = pipeline.execute().await?;
    /// println!("Pipeline results: {:?}", results);
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self.inner.as_ref(), self.inner.config.type_mapping)
    }

    /// Create a new transaction for atomic command execution
    ///
    /// Commands are held locally until `exec` or `exec_typed` sends
    /// `MULTI`, the commands and `EXEC` together.
    #[must_use]
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction::new(self.inner.as_ref(), self.inner.config.type_mapping)
    }

    /// Create a new subscriber for receiving messages from Redis channels
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use redis_conduit::{Client, ConnectionConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = ConnectionConfig::new("redis://localhost:6379");
    /// let client = Client::connect(config).await?;
    ///
    /// let mut subscriber = client.subscriber();
    /// subscriber.subscribe(["news"]).await?;
    ///
    /// while let Some(message) = subscriber.next_message().await {
    ///     println!("Received: {} on {}", message.payload_str(), message.channel);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn subscriber(&self) -> Subscriber {
        let connection: Arc<dyn PubSubConnection> = self.inner.clone();
        Subscriber::new(Arc::clone(&self.inner.router), connection)
    }

    /// Receive RESP3 push frames that are not pub/sub messages, e.g. `invalidate`
    #[must_use]
    pub fn push_listener(&self) -> mpsc::UnboundedReceiver<RespValue> {
        self.inner.router.push_listener()
    }

    /// Close every connection; pending and later commands fail with [`RedisError::Closed`]
    pub async fn quit(&self) {
        info!("Closing client");
        if let Some(conn) = self.inner.pubsub.get() {
            conn.close().await;
        }
        match &self.inner.backend {
            Backend::Standalone(conn) => conn.close().await,
            Backend::Cluster(cluster) => cluster.close().await,
        }
    }

    /// Address of the standalone server, or the first seed of a cluster
    #[must_use]
    pub fn primary_addr(&self) -> Option<NodeAddr> {
        match &self.inner.backend {
            Backend::Standalone(conn) => Some(conn.addr().clone()),
            Backend::Cluster(_) => self.inner.config.parse_endpoints().into_iter().next(),
        }
    }
}

#[async_trait]
impl Commands for Client {
    async fn execute<O: Send + 'static>(&self, command: TypedCommand<O>) -> RedisResult<O> {
        self.inner
            .execute(self.inner.config.type_mapping, command)
            .await
    }

    async fn call<I, A>(&self, args: I) -> RedisResult<RedisValue>
    where
        I: IntoIterator<Item = A> + Send,
        A: IntoArg + Send,
    {
        let command = Command::from_args(args)?;
        self.inner
            .call(self.inner.config.type_mapping, command)
            .await
    }
}

/// A client with its own type mapping
///
/// Borrows the client's connections; it cannot outlive the [`Client`].
#[derive(Clone, Copy)]
pub struct ClientView<'a> {
    client: &'a Client,
    mapping: TypeMapping,
}

impl<'a> ClientView<'a> {
    /// The mapping this view applies
    #[must_use]
    pub const fn type_mapping(&self) -> TypeMapping {
        self.mapping
    }

    /// A pipeline whose replies use this view's mapping
    #[must_use]
    pub fn pipeline(&self) -> Pipeline<'a> {
        Pipeline::new(self.client.inner.as_ref(), self.mapping)
    }

    /// A transaction whose untyped results use this view's mapping
    #[must_use]
    pub fn transaction(&self) -> Transaction<'a> {
        Transaction::new(self.client.inner.as_ref(), self.mapping)
    }
}

#[async_trait]
impl Commands for ClientView<'_> {
    async fn execute<O: Send + 'static>(&self, command: TypedCommand<O>) -> RedisResult<O> {
        self.client.inner.execute(self.mapping, command).await
    }

    async fn call<I, A>(&self, args: I) -> RedisResult<RedisValue>
    where
        I: IntoIterator<Item = A> + Send,
        A: IntoArg + Send,
    {
        let command = Command::from_args(args)?;
        self.client.inner.call(self.mapping, command).await
    }
}
