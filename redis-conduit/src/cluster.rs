//! Redis Cluster support
//!
//! This module provides functionality for Redis Cluster operations including:
//! - Slot calculation using CRC16
//! - An immutable slot map, swapped wholesale on refresh
//! - MOVED, ASK, CLUSTERDOWN and TRYAGAIN handling
//! - One multiplexed connection per node

use crate::commands::{self, Command};
use crate::connection::{Connection, NodeRole};
use crate::core::{
    config::{ConnectionConfig, ProtocolVersion},
    error::{RedisError, RedisResult},
    types::{NodeAddr, NodeInfo, SlotRange},
    value::RespValue,
};
use crate::pipeline::ReplyBatch;
use crate::pubsub::{PubSubKind, SubscriptionRouter};
use arc_swap::ArcSwap;
use crc16::*;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Total number of hash slots in Redis Cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Calculate the hash slot for a given key
///
/// This implements the Redis Cluster key hashing algorithm:
/// - If the key contains {...}, only the part between the first { and first } is hashed
/// - Otherwise, the entire key is hashed
/// - The hash is CRC16 mod 16384
pub fn calculate_slot(key: &[u8]) -> u16 {
    let hash_key = extract_hash_tag(key);
    State::<XMODEM>::calculate(hash_key) % CLUSTER_SLOTS
}

/// Extract the hash tag from a key
///
/// Hash tags allow you to ensure multiple keys are allocated to the same hash slot.
/// For example: `{user1000}.following` and `{user1000}.followers` will hash to the same slot.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + end;
            // An empty tag means the whole key is hashed
            if end > start + 1 {
                return &key[start + 1..end];
            }
        }
    }
    key
}

/// Slot shared by the keys of a batch, if any key is present
///
/// # Errors
///
/// Returns [`RedisError::Cluster`] when the keys hash to different slots.
pub fn batch_slot(commands: &[Command]) -> RedisResult<Option<u16>> {
    let mut slot = None;
    for key in commands.iter().flat_map(Command::keys) {
        let current = calculate_slot(key);
        match slot {
            None => slot = Some(current),
            Some(existing) if existing != current => {
                return Err(RedisError::Cluster(
                    "CROSSSLOT keys in request don't hash to the same slot".to_string(),
                ));
            }
            Some(_) => {}
        }
    }
    Ok(slot)
}

/// One contiguous slot range and the nodes serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    /// Slots covered
    pub range: SlotRange,
    /// Node accepting writes
    pub primary: NodeAddr,
    /// Nodes that may serve reads
    pub replicas: Vec<NodeAddr>,
}

/// Immutable slot to node mapping
///
/// Entries are sorted by their first slot and never overlap. Updates build a
/// new map; readers holding the old one are never affected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotMap {
    entries: Vec<SlotEntry>,
}

impl SlotMap {
    /// Build from entries; overlapping ranges keep the first one given
    pub fn new(mut entries: Vec<SlotEntry>) -> Self {
        entries.sort_by_key(|e| e.range.start);
        let mut kept: Vec<SlotEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            if kept.last().is_some_and(|last| last.range.end >= entry.range.start) {
                warn!(
                    "Ignoring overlapping slot range {}-{}",
                    entry.range.start, entry.range.end
                );
                continue;
            }
            kept.push(entry);
        }
        Self { entries: kept }
    }

    /// Parse a `CLUSTER SLOTS` reply obtained from `queried`
    ///
    /// Each element is `[start, end, [host, port, id?], replicas...]`. An
    /// empty or null host stands for the queried node; `?` marks a node
    /// without a reachable endpoint, which is skipped.
    pub fn from_cluster_slots(reply: RespValue, queried: &NodeAddr) -> RedisResult<Self> {
        let mut entries = Vec::new();
        for range in reply.into_array()? {
            let mut items = range.into_array()?.into_iter();
            let start = slot_number(items.next())?;
            let end = slot_number(items.next())?;
            if start > end {
                return Err(RedisError::Protocol(format!(
                    "Invalid slot range {}-{}",
                    start, end
                )));
            }

            let mut nodes = Vec::new();
            for node in items {
                if let Some(addr) = parse_node(node, queried)? {
                    nodes.push(addr);
                }
            }
            if nodes.is_empty() {
                continue;
            }
            let primary = nodes.remove(0);
            entries.push(SlotEntry {
                range: SlotRange::new(start, end),
                primary,
                replicas: nodes,
            });
        }
        Ok(Self::new(entries))
    }

    fn entry_for(&self, slot: u16) -> Option<&SlotEntry> {
        let index = self.entries.partition_point(|e| e.range.end < slot);
        self.entries
            .get(index)
            .filter(|entry| entry.range.contains(slot))
    }

    /// Primary serving `slot`
    pub fn primary_for(&self, slot: u16) -> Option<&NodeAddr> {
        self.entry_for(slot).map(|e| &e.primary)
    }

    /// Replicas serving `slot`
    pub fn replicas_for(&self, slot: u16) -> &[NodeAddr] {
        self.entry_for(slot).map_or(&[], |e| &e.replicas)
    }

    /// A copy of this map with `slot` owned by `addr` alone
    #[must_use]
    pub fn with_slot_moved(&self, slot: u16, addr: NodeAddr) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() + 2);
        let moved = SlotEntry {
            range: SlotRange::new(slot, slot),
            primary: addr,
            replicas: Vec::new(),
        };
        let mut placed = false;
        for entry in &self.entries {
            if !entry.range.contains(slot) {
                entries.push(entry.clone());
                continue;
            }
            if entry.range.start < slot {
                entries.push(SlotEntry {
                    range: SlotRange::new(entry.range.start, slot - 1),
                    ..entry.clone()
                });
            }
            entries.push(moved.clone());
            placed = true;
            if slot < entry.range.end {
                entries.push(SlotEntry {
                    range: SlotRange::new(slot + 1, entry.range.end),
                    ..entry.clone()
                });
            }
        }
        if !placed {
            entries.push(moved);
        }
        Self::new(entries)
    }

    /// Slot ranges in slot order
    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    /// Whether no slot is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of slots with an owner
    pub fn covered_slots(&self) -> usize {
        self.entries
            .iter()
            .map(|e| usize::from(e.range.end - e.range.start) + 1)
            .sum()
    }

    /// Every primary, in slot order without duplicates
    pub fn primaries(&self) -> Vec<NodeAddr> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            if !seen.contains(&entry.primary) {
                seen.push(entry.primary.clone());
            }
        }
        seen
    }

    /// Every known node, primaries first
    pub fn nodes(&self) -> Vec<NodeAddr> {
        let mut nodes = self.primaries();
        for replica in self.entries.iter().flat_map(|e| &e.replicas) {
            if !nodes.contains(replica) {
                nodes.push(replica.clone());
            }
        }
        nodes
    }

    /// Node view grouped by primary, replicas listed without slots
    pub fn node_info(&self) -> Vec<NodeInfo> {
        let mut primaries: BTreeMap<NodeAddr, NodeInfo> = BTreeMap::new();
        let mut replicas: BTreeMap<NodeAddr, NodeInfo> = BTreeMap::new();
        for entry in &self.entries {
            primaries
                .entry(entry.primary.clone())
                .or_insert_with(|| NodeInfo::new(String::new(), entry.primary.clone()))
                .slots
                .push(entry.range);
            for replica in &entry.replicas {
                replicas.entry(replica.clone()).or_insert_with(|| {
                    let mut info = NodeInfo::new(String::new(), replica.clone());
                    info.is_master = false;
                    info
                });
            }
        }
        primaries.into_values().chain(replicas.into_values()).collect()
    }
}

fn slot_number(value: Option<RespValue>) -> RedisResult<u16> {
    let raw = value
        .ok_or_else(|| RedisError::Protocol("Missing slot number".to_string()))?
        .as_int()?;
    u16::try_from(raw)
        .ok()
        .filter(|slot| *slot < CLUSTER_SLOTS)
        .ok_or_else(|| RedisError::Protocol(format!("Slot {} out of range", raw)))
}

fn parse_node(node: RespValue, queried: &NodeAddr) -> RedisResult<Option<NodeAddr>> {
    let items = node.into_array()?;
    let host = match items.first() {
        None | Some(RespValue::Null) => String::new(),
        Some(value) => value.as_string()?,
    };
    if host == "?" {
        return Ok(None);
    }
    let host = if host.is_empty() {
        queried.host.clone()
    } else {
        host
    };
    let port = items
        .get(1)
        .ok_or_else(|| RedisError::Protocol("Missing node port".to_string()))?
        .as_int()?;
    let port = u16::try_from(port)
        .map_err(|_| RedisError::Protocol(format!("Invalid node port {}", port)))?;
    Ok(Some(NodeAddr::new(host, port)))
}

/// Redirect or cluster-state error carried by a reply, if any
fn find_redirect(batch: &ReplyBatch) -> Option<RedisError> {
    batch.frames.iter().find_map(|frame| match frame {
        RespValue::Error(msg) => match RedisError::from_server_message(msg) {
            error @ (RedisError::Moved { .. }
            | RedisError::Ask { .. }
            | RedisError::ClusterDown(_)
            | RedisError::TryAgain(_)) => Some(error),
            _ => None,
        },
        _ => None,
    })
}

/// Client side of a Redis Cluster
///
/// Holds the slot map behind an [`ArcSwap`] and one [`Connection`] per node.
/// Refreshes are serialized; a caller that waited for a refresh started by
/// someone else reuses its result instead of querying again.
pub struct ClusterClient {
    config: Arc<ConnectionConfig>,
    seeds: Vec<NodeAddr>,
    slots: ArcSwap<SlotMap>,
    connections: RwLock<HashMap<NodeAddr, Connection>>,
    pubsub_connections: Mutex<HashMap<NodeAddr, Connection>>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
    router: Arc<SubscriptionRouter>,
}

impl ClusterClient {
    /// Connect to the seed nodes and load the slot map
    ///
    /// # Errors
    ///
    /// Fails when no seed node answers `CLUSTER SLOTS`.
    pub async fn connect(
        config: Arc<ConnectionConfig>,
        router: Arc<SubscriptionRouter>,
    ) -> RedisResult<Arc<Self>> {
        let seeds = config.parse_endpoints();
        if seeds.is_empty() {
            return Err(RedisError::Config("No endpoints specified".to_string()));
        }

        let client = Arc::new(Self {
            config,
            seeds,
            slots: ArcSwap::from_pointee(SlotMap::default()),
            connections: RwLock::new(HashMap::new()),
            pubsub_connections: Mutex::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            router,
        });
        client.refresh_slots().await?;
        Self::spawn_periodic_refresh(&client);
        Ok(client)
    }

    fn spawn_periodic_refresh(this: &Arc<Self>) {
        let Some(period) = this
            .config
            .cluster_refresh_interval
            .filter(|p| !p.is_zero())
        else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(this);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = this.refresh_slots().await {
                    warn!("Periodic slot refresh failed: {}", e);
                }
            }
        });
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.refresh_slots().await {
                warn!("Slot refresh failed: {}", e);
            }
        });
    }

    /// Current slot map
    pub fn slot_map(&self) -> Arc<SlotMap> {
        self.slots.load_full()
    }

    /// Re-query the slot layout and swap in the result.
    ///
    /// Concurrent calls collapse: whoever waited on the lock while another
    /// refresh completed returns without querying again.
    pub async fn refresh_slots(&self) -> RedisResult<()> {
        let observed = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            debug!("Slot refresh already completed by another task");
            return Ok(());
        }

        let map = self.fetch_slot_map().await?;
        info!(
            "Refreshed slot map: {} ranges covering {} slots across {} nodes",
            map.entries().len(),
            map.covered_slots(),
            map.nodes().len()
        );
        self.slots.store(Arc::new(map));
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn fetch_slot_map(&self) -> RedisResult<SlotMap> {
        let mut candidates = self.slots.load().nodes();
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let query = Command::from(commands::cluster_slots());
        let mut last_error = None;
        for addr in candidates {
            let attempt = async {
                let conn = self.connection(&addr, NodeRole::Primary).await?;
                let (reply, _) = conn.send(&query).await?;
                SlotMap::from_cluster_slots(reply.into_result()?, &addr)
            };
            match attempt.await {
                Ok(map) if !map.is_empty() => return Ok(map),
                Ok(_) => {
                    last_error = Some(RedisError::Cluster(format!(
                        "{} reported no slots",
                        addr
                    )));
                }
                Err(e) => {
                    debug!("CLUSTER SLOTS on {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| RedisError::Cluster("No cluster node reachable".to_string())))
    }

    async fn connection(&self, addr: &NodeAddr, role: NodeRole) -> RedisResult<Connection> {
        if let Some(conn) = self.connections.read().await.get(addr) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let conn = Connection::connect(
            addr.clone(),
            Arc::clone(&self.config),
            role,
            Some(Arc::clone(&self.router)),
        )
        .await?;
        let mut connections = self.connections.write().await;
        let entry = connections
            .entry(addr.clone())
            .or_insert_with(|| conn.clone());
        if entry.is_closed() {
            *entry = conn;
        }
        Ok(entry.clone())
    }

    fn target_for(&self, slot: Option<u16>, read_only: bool) -> RedisResult<(NodeAddr, NodeRole)> {
        let map = self.slots.load();
        let Some(slot) = slot else {
            return map
                .primaries()
                .into_iter()
                .next()
                .map(|addr| (addr, NodeRole::Primary))
                .ok_or_else(|| RedisError::Cluster("Slot map is empty".to_string()));
        };
        if read_only && self.config.read_from_replicas {
            if let Some(replica) = map.replicas_for(slot).choose(&mut rand::thread_rng()) {
                return Ok((replica.clone(), NodeRole::Replica));
            }
        }
        map.primary_for(slot)
            .map(|addr| (addr.clone(), NodeRole::Primary))
            .ok_or_else(|| RedisError::Cluster(format!("No node serves slot {}", slot)))
    }

    /// Send one command to the node owning its key
    pub async fn send(
        self: &Arc<Self>,
        command: &Command,
    ) -> RedisResult<(RespValue, ProtocolVersion)> {
        self.dispatch(std::slice::from_ref(command))
            .await?
            .into_single()
    }

    /// Send commands whose keys share a slot to the owning node, following redirects.
    ///
    /// When the redirect budget runs out, the batch holding the last
    /// redirect error is returned so the caller sees that error.
    pub async fn dispatch(self: &Arc<Self>, commands: &[Command]) -> RedisResult<ReplyBatch> {
        let slot = batch_slot(commands)?;
        let read_only = commands.iter().all(Command::is_read_only);
        let max_redirects = self.config.max_redirects;
        let mut redirected_to: Option<NodeAddr> = None;
        let mut asking = false;
        let mut redirects = 0;

        loop {
            let (addr, role) = match redirected_to.take() {
                Some(addr) => (addr, NodeRole::Primary),
                None => self.target_for(slot, read_only)?,
            };

            let conn = match self.connection(&addr, role).await {
                Ok(conn) => conn,
                Err(e) if redirects < max_redirects => {
                    warn!("Cannot reach {}: {}", addr, e);
                    redirects += 1;
                    if let Err(refresh) = self.refresh_slots().await {
                        debug!("Slot refresh after connect failure failed: {}", refresh);
                    }
                    tokio::time::sleep(self.config.reconnect.delay_for(redirects - 1)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let batch = if asking {
                asking = false;
                let mut with_asking = Vec::with_capacity(commands.len() + 1);
                with_asking.push(Command::new("ASKING"));
                with_asking.extend_from_slice(commands);
                let mut batch = conn.send_batch(&with_asking).await?;
                if !batch.frames.is_empty() {
                    if let RespValue::Error(msg) = batch.frames.remove(0) {
                        warn!("ASKING refused by {}: {}", addr, msg);
                        return Err(RedisError::from_server_message(&msg));
                    }
                }
                batch
            } else {
                conn.send_batch(commands).await?
            };

            let Some(redirect) = find_redirect(&batch) else {
                return Ok(batch);
            };
            if redirects >= max_redirects {
                warn!("Giving up after {} redirects: {}", redirects, redirect);
                return Ok(batch);
            }
            redirects += 1;

            match redirect {
                RedisError::Moved { slot, host, port } => {
                    let target = NodeAddr::new(host, port);
                    debug!("Slot {} moved to {}", slot, target);
                    self.slots
                        .rcu(|map| map.with_slot_moved(slot, target.clone()));
                    self.spawn_refresh();
                    redirected_to = Some(target);
                }
                RedisError::Ask { slot, host, port } => {
                    let target = NodeAddr::new(host, port);
                    debug!("Slot {} migrating, asking {}", slot, target);
                    redirected_to = Some(target);
                    asking = true;
                }
                other => {
                    debug!("Cluster not ready ({}), retrying", other);
                    if let Err(e) = self.refresh_slots().await {
                        debug!("Slot refresh failed: {}", e);
                    }
                    tokio::time::sleep(self.config.reconnect.delay_for(redirects - 1)).await;
                }
            }
        }
    }

    /// Connection carrying subscriptions of `kind`.
    ///
    /// Shard channels go to the node owning the channel's slot; channels and
    /// patterns to the first primary. A RESP3 node connection carries them
    /// directly, a RESP2 node gets a dedicated connection.
    pub(crate) async fn pubsub_connection(
        &self,
        kind: PubSubKind,
        command: &Command,
    ) -> RedisResult<Connection> {
        let slot = match kind {
            PubSubKind::Shard => command.key().map(calculate_slot),
            PubSubKind::Channel | PubSubKind::Pattern => None,
        };
        let (addr, _) = self.target_for(slot, false)?;
        let conn = self.connection(&addr, NodeRole::Primary).await?;
        if conn.protocol() == ProtocolVersion::Resp3 {
            return Ok(conn);
        }

        let mut dedicated = self.pubsub_connections.lock().await;
        if let Some(conn) = dedicated.get(&addr).filter(|c| !c.is_closed()) {
            return Ok(conn.clone());
        }
        let conn = Connection::connect(
            addr.clone(),
            Arc::clone(&self.config),
            NodeRole::Primary,
            Some(Arc::clone(&self.router)),
        )
        .await?;
        dedicated.insert(addr, conn.clone());
        Ok(conn)
    }

    /// Protocol of an established node connection, if any
    pub async fn protocol(&self) -> Option<ProtocolVersion> {
        self.connections
            .read()
            .await
            .values()
            .next()
            .map(Connection::protocol)
    }

    /// Close every node connection
    pub async fn close(&self) {
        let connections: Vec<Connection> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        let dedicated: Vec<Connection> = self
            .pubsub_connections
            .lock()
            .await
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in connections.iter().chain(&dedicated) {
            conn.close().await;
        }
    }
}
