//! Pub/Sub support for Redis
//!
//! Subscriptions are tracked by a [`SubscriptionRouter`] shared by every
//! connection that carries them. Connection drivers classify inbound frames
//! with [`classify`]: messages go to the router, which hands them to each
//! [`Subscriber`] registered for the channel, pattern or shard channel;
//! acknowledgements resolve the pending subscribe call; anything else stays
//! on the ordinary reply path.
//!
//! Under RESP3 the server tags these frames as pushes, so subscriptions can
//! share a connection with normal traffic. Under RESP2 they are plain arrays
//! and the connection cannot run other commands while subscribed, so the
//! client uses a dedicated connection for them.
//!
//! # Examples
//!
//! ```no_run
//! use redis_conduit::{Client, ConnectionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::connect(ConnectionConfig::new("redis://localhost:6379")).await?;
//!
//! let mut subscriber = client.subscriber();
//! subscriber.subscribe(["news", "updates"]).await?;
//!
//! while let Some(message) = subscriber.next_message().await {
//!     println!("{}: {:?}", message.channel, message.payload);
//! }
//! # Ok(())
//! # }
//! ```

use crate::commands::{Command, IntoArg};
use crate::core::{config::ProtocolVersion, error::RedisResult, value::RespValue};
use bytes::Bytes;
use futures_util::Stream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Kind of subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PubSubKind {
    /// `SUBSCRIBE` to an exact channel name
    Channel,
    /// `PSUBSCRIBE` to a glob-style pattern
    Pattern,
    /// `SSUBSCRIBE` to a shard channel, routed by its slot in a cluster
    Shard,
}

impl PubSubKind {
    /// Command that adds subscriptions of this kind
    #[must_use]
    pub const fn subscribe_command(self) -> &'static str {
        match self {
            Self::Channel => "SUBSCRIBE",
            Self::Pattern => "PSUBSCRIBE",
            Self::Shard => "SSUBSCRIBE",
        }
    }

    /// Command that removes subscriptions of this kind
    #[must_use]
    pub const fn unsubscribe_command(self) -> &'static str {
        match self {
            Self::Channel => "UNSUBSCRIBE",
            Self::Pattern => "PUNSUBSCRIBE",
            Self::Shard => "SUNSUBSCRIBE",
        }
    }

    /// Build the (un)subscribe command for `names`
    pub(crate) fn command(self, subscribe: bool, names: &[Bytes]) -> Command {
        let name = if subscribe {
            self.subscribe_command()
        } else {
            self.unsubscribe_command()
        };
        let command = Command::new(name).args(names.iter().cloned());
        match self {
            Self::Shard => command.with_key_index(Some(1)),
            Self::Channel | Self::Pattern => command,
        }
    }
}

/// A message received from a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// Which kind of subscription delivered it
    pub kind: PubSubKind,
    /// The channel the message was published to
    pub channel: String,
    /// The pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
    /// The message payload
    pub payload: Bytes,
}

impl PubSubMessage {
    /// The payload as UTF-8 text, replacing invalid sequences
    #[must_use]
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Server acknowledgement of a subscribe or unsubscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Ack {
    pub(crate) kind: PubSubKind,
    pub(crate) subscribe: bool,
    pub(crate) name: Bytes,
    /// Subscriptions the connection still holds after this one
    pub(crate) remaining: i64,
}

/// Where an inbound frame belongs
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Reply(RespValue),
    Message(PubSubMessage),
    Ack(Ack, RespValue),
    Push(RespValue),
}

enum Event {
    Message(PubSubMessage),
    Ack(Ack),
}

fn text(value: &RespValue) -> Option<String> {
    value
        .as_bytes()
        .ok()
        .map(|b| String::from_utf8_lossy(&b).into_owned())
}

fn parse_event(items: &[RespValue]) -> Option<Event> {
    let tag = text(items.first()?)?.to_ascii_lowercase();
    let message = |kind, channel: &RespValue, payload: &RespValue, pattern| {
        Some(Event::Message(PubSubMessage {
            kind,
            channel: text(channel)?,
            pattern,
            payload: payload.as_bytes().ok()?,
        }))
    };
    let ack = |kind, subscribe| {
        let name = match items.get(1)? {
            RespValue::Null => Bytes::new(),
            other => other.as_bytes().ok()?,
        };
        Some(Event::Ack(Ack {
            kind,
            subscribe,
            name,
            remaining: items.get(2)?.as_int().ok()?,
        }))
    };

    match (tag.as_str(), items.len()) {
        ("message", 3) => message(PubSubKind::Channel, &items[1], &items[2], None),
        ("smessage", 3) => message(PubSubKind::Shard, &items[1], &items[2], None),
        ("pmessage", 4) => message(PubSubKind::Pattern, &items[2], &items[3], text(&items[1])),
        ("subscribe", 3) => ack(PubSubKind::Channel, true),
        ("psubscribe", 3) => ack(PubSubKind::Pattern, true),
        ("ssubscribe", 3) => ack(PubSubKind::Shard, true),
        ("unsubscribe", 3) => ack(PubSubKind::Channel, false),
        ("punsubscribe", 3) => ack(PubSubKind::Pattern, false),
        ("sunsubscribe", 3) => ack(PubSubKind::Shard, false),
        _ => None,
    }
}

/// Sort an inbound frame onto the reply path or the pub/sub path.
///
/// `pubsub_mode` tells a RESP2 connection that it is subscribed, which is
/// the only case where a plain array can be a pub/sub event.
pub(crate) fn classify(frame: RespValue, version: ProtocolVersion, pubsub_mode: bool) -> Inbound {
    match frame {
        RespValue::Push(items) => match parse_event(&items) {
            Some(Event::Message(message)) => Inbound::Message(message),
            Some(Event::Ack(ack)) => Inbound::Ack(ack, RespValue::Push(items)),
            None => Inbound::Push(RespValue::Push(items)),
        },
        RespValue::Array(items) if version == ProtocolVersion::Resp2 && pubsub_mode => {
            match parse_event(&items) {
                Some(Event::Message(message)) => Inbound::Message(message),
                Some(Event::Ack(ack)) => Inbound::Ack(ack, RespValue::Array(items)),
                None => Inbound::Reply(RespValue::Array(items)),
            }
        }
        other => Inbound::Reply(other),
    }
}

/// Aggregate subscription state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscriptions and nothing in flight
    Unsubscribed,
    /// Waiting for subscribe acknowledgements
    Subscribing,
    /// At least one active subscription, nothing in flight
    Subscribed,
    /// Waiting for unsubscribe acknowledgements
    Unsubscribing,
}

type SubscriberId = u64;
type SubscriptionKey = (PubSubKind, Bytes);

#[derive(Debug, Default)]
struct RouterState {
    entries: HashMap<SubscriptionKey, Vec<SubscriberId>>,
    senders: HashMap<SubscriberId, mpsc::UnboundedSender<PubSubMessage>>,
    pending_subscribe: usize,
    pending_unsubscribe: usize,
    next_id: SubscriberId,
    push_listener: Option<mpsc::UnboundedSender<RespValue>>,
}

/// Registry of subscriptions and the handles waiting on them
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    state: Mutex<RouterState>,
}

impl SubscriptionRouter {
    /// Create an empty router
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self) -> (SubscriberId, mpsc::UnboundedReceiver<PubSubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.senders.insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber; returns the names nobody listens to any more
    pub(crate) fn deregister(&self, id: SubscriberId) -> Vec<SubscriptionKey> {
        let mut state = self.lock();
        state.senders.remove(&id);
        let mut orphaned = Vec::new();
        state.entries.retain(|key, ids| {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                orphaned.push(key.clone());
                false
            } else {
                true
            }
        });
        orphaned
    }

    /// Add names for a subscriber; returns those that need a server subscription
    pub(crate) fn add(&self, id: SubscriberId, kind: PubSubKind, names: &[Bytes]) -> Vec<Bytes> {
        let mut state = self.lock();
        let mut fresh = Vec::new();
        for name in names {
            let ids = state.entries.entry((kind, name.clone())).or_default();
            if ids.is_empty() {
                fresh.push(name.clone());
            }
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        fresh
    }

    /// Remove names for a subscriber; returns those left without listeners
    pub(crate) fn remove(&self, id: SubscriberId, kind: PubSubKind, names: &[Bytes]) -> Vec<Bytes> {
        let mut state = self.lock();
        let mut orphaned = Vec::new();
        for name in names {
            let key = (kind, name.clone());
            if let Some(ids) = state.entries.get_mut(&key) {
                ids.retain(|i| *i != id);
                if ids.is_empty() {
                    state.entries.remove(&key);
                    orphaned.push(name.clone());
                }
            }
        }
        orphaned
    }

    pub(crate) fn begin_pending(&self, subscribe: bool, count: usize) {
        let mut state = self.lock();
        if subscribe {
            state.pending_subscribe += count;
        } else {
            state.pending_unsubscribe += count;
        }
    }

    pub(crate) fn finish_pending(&self, subscribe: bool, count: usize) {
        let mut state = self.lock();
        if subscribe {
            state.pending_subscribe = state.pending_subscribe.saturating_sub(count);
        } else {
            state.pending_unsubscribe = state.pending_unsubscribe.saturating_sub(count);
        }
    }

    /// Deliver a message to every subscriber of its channel, pattern or shard channel.
    ///
    /// Returns how many subscribers received it.
    pub(crate) fn dispatch(&self, message: &PubSubMessage) -> usize {
        let name = match (&message.kind, &message.pattern) {
            (PubSubKind::Pattern, Some(pattern)) => pattern.as_bytes(),
            _ => message.channel.as_bytes(),
        };
        let key = (message.kind, Bytes::copy_from_slice(name));

        let mut state = self.lock();
        let Some(ids) = state.entries.get(&key).cloned() else {
            debug!("No subscriber for message on {}", message.channel);
            return 0;
        };
        let mut delivered = 0;
        for id in ids {
            let sent = state
                .senders
                .get(&id)
                .is_some_and(|tx| tx.send(message.clone()).is_ok());
            if sent {
                delivered += 1;
            } else {
                state.senders.remove(&id);
            }
        }
        delivered
    }

    /// Hand a non-pub/sub push frame to the push listener, if any
    pub(crate) fn forward_push(&self, frame: RespValue) {
        let mut state = self.lock();
        let delivered = state
            .push_listener
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !delivered {
            state.push_listener = None;
            debug!("Dropping push frame without a listener");
        }
    }

    /// Receive push frames that are not pub/sub traffic, replacing any previous listener
    pub fn push_listener(&self) -> mpsc::UnboundedReceiver<RespValue> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push_listener = Some(tx);
        rx
    }

    /// Forget subscriptions whose connection is gone for good.
    ///
    /// Subscribers left without any subscription see their stream end.
    pub(crate) fn connection_lost(&self, lost: &[SubscriptionKey]) {
        if lost.is_empty() {
            return;
        }
        warn!("Dropping {} subscriptions after connection loss", lost.len());
        let mut state = self.lock();
        for key in lost {
            state.entries.remove(key);
        }
        let listening: HashSet<SubscriberId> =
            state.entries.values().flatten().copied().collect();
        state.senders.retain(|id, _| listening.contains(id));
    }

    /// Current aggregate state
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        let state = self.lock();
        if state.pending_subscribe > 0 {
            SubscriptionState::Subscribing
        } else if state.pending_unsubscribe > 0 {
            SubscriptionState::Unsubscribing
        } else if state.entries.is_empty() {
            SubscriptionState::Unsubscribed
        } else {
            SubscriptionState::Subscribed
        }
    }

    /// Number of distinct subscribed names across all kinds
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock().entries.len()
    }
}

/// Transport a [`Subscriber`] sends its commands through
#[async_trait::async_trait]
pub trait PubSubConnection: Send + Sync {
    /// Send a (un)subscribe command and wait for its `acks` acknowledgements
    async fn send_pubsub(&self, kind: PubSubKind, command: Command, acks: usize) -> RedisResult<()>;
}

/// Redis Pub/Sub subscriber
///
/// Dropping the subscriber unsubscribes from every name no other subscriber
/// still listens to.
pub struct Subscriber {
    id: SubscriberId,
    router: Arc<SubscriptionRouter>,
    connection: Arc<dyn PubSubConnection>,
    messages: mpsc::UnboundedReceiver<PubSubMessage>,
    names: HashSet<SubscriptionKey>,
}

impl Subscriber {
    /// Create a subscriber with no subscriptions
    pub fn new(router: Arc<SubscriptionRouter>, connection: Arc<dyn PubSubConnection>) -> Self {
        let (id, messages) = router.register();
        Self {
            id,
            router,
            connection,
            messages,
            names: HashSet::new(),
        }
    }

    /// Subscribe to channels
    pub async fn subscribe<I, C>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        self.change(PubSubKind::Channel, true, channels).await
    }

    /// Unsubscribe from channels
    pub async fn unsubscribe<I, C>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        self.change(PubSubKind::Channel, false, channels).await
    }

    /// Subscribe to glob-style patterns
    pub async fn psubscribe<I, C>(&mut self, patterns: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        self.change(PubSubKind::Pattern, true, patterns).await
    }

    /// Unsubscribe from patterns
    pub async fn punsubscribe<I, C>(&mut self, patterns: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        self.change(PubSubKind::Pattern, false, patterns).await
    }

    /// Subscribe to shard channels
    pub async fn ssubscribe<I, C>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        self.change(PubSubKind::Shard, true, channels).await
    }

    /// Unsubscribe from shard channels
    pub async fn sunsubscribe<I, C>(&mut self, channels: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        self.change(PubSubKind::Shard, false, channels).await
    }

    async fn change<I, C>(&mut self, kind: PubSubKind, subscribe: bool, names: I) -> RedisResult<()>
    where
        I: IntoIterator<Item = C>,
        C: IntoArg,
    {
        let mut names: Vec<Bytes> = names.into_iter().map(IntoArg::into_arg).collect();
        names.dedup();
        if names.is_empty() {
            return Ok(());
        }

        // Only names this call adds are rolled back if the server refuses them.
        let added: Vec<Bytes> = names
            .iter()
            .filter(|name| subscribe && !self.names.contains(&(kind, (*name).clone())))
            .cloned()
            .collect();
        let to_send = if subscribe {
            self.router.add(self.id, kind, &names)
        } else {
            self.router.remove(self.id, kind, &names)
        };
        for name in &names {
            if subscribe {
                self.names.insert((kind, name.clone()));
            } else {
                self.names.remove(&(kind, name.clone()));
            }
        }
        if to_send.is_empty() {
            return Ok(());
        }

        self.router.begin_pending(subscribe, to_send.len());
        let result = send_changes(self.connection.as_ref(), kind, subscribe, &to_send).await;
        self.router.finish_pending(subscribe, to_send.len());

        if result.is_err() && !added.is_empty() {
            self.router.remove(self.id, kind, &added);
            for name in &added {
                self.names.remove(&(kind, name.clone()));
            }
        }
        result
    }

    /// Wait for the next message; `None` once no subscription can deliver any more
    pub async fn next_message(&mut self) -> Option<PubSubMessage> {
        self.messages.recv().await
    }

    /// Names this subscriber listens to, of the given kind
    #[must_use]
    pub fn subscriptions(&self, kind: PubSubKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| String::from_utf8_lossy(name).into_owned())
            .collect();
        names.sort();
        names
    }

    /// State shared by every subscriber of the client
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.router.state()
    }
}

async fn send_changes(
    connection: &dyn PubSubConnection,
    kind: PubSubKind,
    subscribe: bool,
    names: &[Bytes],
) -> RedisResult<()> {
    match kind {
        // Shard channels may live on different nodes.
        PubSubKind::Shard => {
            for name in names {
                let command = kind.command(subscribe, std::slice::from_ref(name));
                connection.send_pubsub(kind, command, 1).await?;
            }
            Ok(())
        }
        PubSubKind::Channel | PubSubKind::Pattern => {
            connection
                .send_pubsub(kind, kind.command(subscribe, names), names.len())
                .await
        }
    }
}

impl Stream for Subscriber {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let orphaned = self.router.deregister(self.id);
        if orphaned.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = Arc::clone(&self.connection);
        handle.spawn(async move {
            let mut by_kind: HashMap<PubSubKind, Vec<Bytes>> = HashMap::new();
            for (kind, name) in orphaned {
                by_kind.entry(kind).or_default().push(name);
            }
            for (kind, names) in by_kind {
                if let Err(e) = send_changes(connection.as_ref(), kind, false, &names).await {
                    debug!("Unsubscribe on drop failed: {}", e);
                }
            }
        });
    }
}
