//! Command pipelining
//!
//! Two layers live here. [`CommandQueue`] is the per-connection FIFO the
//! connection driver uses to pair every decoded reply with the oldest request
//! still waiting for one. [`Pipeline`] is the user-facing batch: it collects
//! commands and writes them back-to-back so they share one network
//! round-trip.
//!
//! # Examples
//!
//! ```no_run
//! use redis_conduit::{Client, ConnectionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("redis://localhost:6379");
//! let client = Client::connect(config).await?;
//!
//! let mut pipeline = client.pipeline();
//! pipeline.set("key1", "value1");
//! pipeline.get("key1");
//! pipeline.incr("counter");
//!
//! for result in pipeline.execute().await? {
//!     println!("{:?}", result?);
//! }
//! # Ok(())
//! # }
//! ```

use crate::commands::{self, Command, IntoArg, TypedCommand};
use crate::core::{
    config::ProtocolVersion,
    error::{RedisError, RedisResult},
    mapping::TypeMapping,
    types::RedisValue,
    value::RespValue,
};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Replies read for one request, with the protocol of the connection that read them
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyBatch {
    /// One frame per command, in send order
    pub frames: Vec<RespValue>,
    /// Protocol negotiated by the connection that produced the frames
    pub version: ProtocolVersion,
}

impl ReplyBatch {
    /// The single frame of a one-command request
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the batch does not hold exactly one frame.
    pub fn into_single(self) -> RedisResult<(RespValue, ProtocolVersion)> {
        let version = self.version;
        let mut frames = self.frames.into_iter();
        match (frames.next(), frames.next()) {
            (Some(frame), None) => Ok((frame, version)),
            _ => Err(RedisError::Protocol(
                "expected exactly one reply frame".to_string(),
            )),
        }
    }
}

pub(crate) type Responder = oneshot::Sender<RedisResult<ReplyBatch>>;

/// How an entry consumes inbound frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// Ordinary request; resolves after `expected` replies
    Reply,
    /// Subscribe or unsubscribe; resolves after `expected` acknowledgements
    /// or on the first error reply
    PubSub,
    /// Internal liveness probe; its reply is discarded
    HealthCheck,
    /// `AUTH` sent after the server reported expired credentials
    Reauth,
}

/// A request waiting for its replies
#[derive(Debug)]
pub(crate) struct PendingEntry {
    expected: usize,
    frames: Vec<RespValue>,
    kind: EntryKind,
    responder: Option<Responder>,
}

impl PendingEntry {
    pub(crate) fn new(kind: EntryKind, expected: usize, responder: Option<Responder>) -> Self {
        Self {
            expected: expected.max(1),
            frames: Vec::with_capacity(expected),
            kind,
            responder,
        }
    }

    pub(crate) const fn kind(&self) -> EntryKind {
        self.kind
    }

    fn resolve(self, version: ProtocolVersion) {
        if let Some(responder) = self.responder {
            // The caller may have timed out already; its reply is then dropped here.
            let _ = responder.send(Ok(ReplyBatch {
                frames: self.frames,
                version,
            }));
        }
    }

    fn fail(self, error: RedisError) {
        if let Some(responder) = self.responder {
            let _ = responder.send(Err(error));
        }
    }
}

/// FIFO of requests written to one socket and not yet answered
#[derive(Debug)]
pub(crate) struct CommandQueue {
    entries: VecDeque<PendingEntry>,
    version: ProtocolVersion,
}

impl CommandQueue {
    pub(crate) fn new(version: ProtocolVersion) -> Self {
        Self {
            entries: VecDeque::new(),
            version,
        }
    }

    pub(crate) fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub(crate) fn push(&mut self, entry: PendingEntry) {
        self.entries.push_back(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn has_health_check(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == EntryKind::HealthCheck)
    }

    pub(crate) fn has_pubsub(&self) -> bool {
        self.entries.iter().any(|e| e.kind == EntryKind::PubSub)
    }

    pub(crate) fn has_reauth(&self) -> bool {
        self.entries.iter().any(|e| e.kind == EntryKind::Reauth)
    }

    /// Kind of the entry the next reply belongs to
    pub(crate) fn head_kind(&self) -> Option<EntryKind> {
        self.entries.front().map(PendingEntry::kind)
    }

    /// Match an ordinary reply frame to the head entry.
    ///
    /// Returns false when nothing was waiting for it.
    pub(crate) fn on_reply(&mut self, frame: RespValue) -> bool {
        let Some(head) = self.entries.front_mut() else {
            warn!("Discarding unmatched reply ({})", frame.type_name());
            return false;
        };
        let complete = match head.kind {
            EntryKind::Reply => {
                head.frames.push(frame);
                head.frames.len() >= head.expected
            }
            // A subscribe command that fails is answered by a single error.
            EntryKind::PubSub => {
                head.frames.push(frame);
                true
            }
            EntryKind::HealthCheck => {
                if let RespValue::Error(ref msg) = frame {
                    debug!("Health check answered with error: {}", msg);
                }
                true
            }
            EntryKind::Reauth => {
                match frame {
                    RespValue::Error(ref msg) => warn!("Re-authentication rejected: {}", msg),
                    _ => debug!("Re-authenticated after credentials refresh"),
                }
                true
            }
        };
        if complete {
            self.pop_resolved();
        }
        true
    }

    /// Match a subscription acknowledgement to the head entry.
    ///
    /// Returns false for acknowledgements nobody asked for, such as the
    /// server dropping a shard channel after a slot migration.
    pub(crate) fn on_ack(&mut self, frame: RespValue) -> bool {
        match self.entries.front_mut() {
            Some(head) if head.kind == EntryKind::PubSub => {
                head.frames.push(frame);
                if head.frames.len() >= head.expected {
                    self.pop_resolved();
                }
                true
            }
            _ => false,
        }
    }

    fn pop_resolved(&mut self) {
        if let Some(entry) = self.entries.pop_front() {
            entry.resolve(self.version);
        }
    }

    /// Resolve every pending entry with an error; returns how many were failed
    pub(crate) fn fail_all(&mut self, error: impl Fn() -> RedisError) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.fail(error());
        }
        count
    }
}

/// Something that can run a batch of commands for a [`Pipeline`]
#[async_trait::async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Send `commands` and return one raw reply per command, in order.
    ///
    /// The outer error reports a failure that lost the whole batch; the
    /// inner results carry per-command failures such as exhausted redirects.
    async fn execute_pipeline(
        &self,
        commands: Vec<Command>,
    ) -> RedisResult<Vec<RedisResult<(RespValue, ProtocolVersion)>>>;
}

/// A batch of commands sent together
pub struct Pipeline<'a> {
    executor: &'a dyn PipelineExecutor,
    mapping: TypeMapping,
    commands: Vec<Command>,
}

impl<'a> Pipeline<'a> {
    /// Create an empty pipeline whose replies are shaped by `mapping`
    pub fn new(executor: &'a dyn PipelineExecutor, mapping: TypeMapping) -> Self {
        Self {
            executor,
            mapping,
            commands: Vec::new(),
        }
    }

    /// Queue a typed command; its reply is returned as a [`RedisValue`]
    pub fn add<O>(&mut self, command: TypedCommand<O>) -> &mut Self {
        self.commands.push(command.into());
        self
    }

    /// Queue a command in wire form
    pub fn add_command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Queue a SET
    pub fn set(&mut self, key: impl IntoArg, value: impl IntoArg) -> &mut Self {
        self.add(commands::set(key, value))
    }

    /// Queue a GET
    pub fn get(&mut self, key: impl IntoArg) -> &mut Self {
        self.add(commands::get(key))
    }

    /// Queue an INCR
    pub fn incr(&mut self, key: impl IntoArg) -> &mut Self {
        self.add(commands::incr(key))
    }

    /// Queue a DEL of one key
    pub fn del(&mut self, key: impl IntoArg) -> &mut Self {
        self.add(commands::del([key]))
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drop every queued command
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Send the queued commands and collect their replies in order.
    ///
    /// The queue is emptied even when sending fails.
    ///
    /// # Errors
    ///
    /// The outer error reports a failure that lost the whole batch; each
    /// inner result carries that command's own server error, if any.
    pub async fn execute(&mut self) -> RedisResult<Vec<RedisResult<RedisValue>>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }
        let commands = std::mem::take(&mut self.commands);
        debug!("Executing pipeline of {} commands", commands.len());
        let replies = self.executor.execute_pipeline(commands).await?;
        let mapping = self.mapping;
        Ok(replies
            .into_iter()
            .map(|reply| reply.and_then(|(frame, _)| mapping.apply(frame)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_replies_resolve_in_send_order() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp2);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            queue.push(PendingEntry::new(EntryKind::Reply, 1, Some(tx)));
            receivers.push(rx);
        }

        for i in 0..3 {
            assert!(queue.on_reply(RespValue::Integer(i)));
        }
        assert!(queue.is_empty());

        for (i, mut rx) in receivers.into_iter().enumerate() {
            let batch = rx.try_recv().unwrap().unwrap();
            assert_eq!(batch.frames, vec![RespValue::Integer(i as i64)]);
        }
    }

    #[test]
    fn test_multi_frame_entry_waits_for_all_replies() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp3);
        let (tx, mut rx) = oneshot::channel();
        queue.push(PendingEntry::new(EntryKind::Reply, 2, Some(tx)));

        queue.on_reply(RespValue::SimpleString("OK".into()));
        assert!(rx.try_recv().is_err());
        queue.on_reply(RespValue::Integer(1));

        let batch = rx.try_recv().unwrap().unwrap();
        assert_eq!(batch.frames.len(), 2);
        assert_eq!(batch.version, ProtocolVersion::Resp3);
    }

    #[test]
    fn test_health_check_reply_is_swallowed() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp2);
        queue.push(PendingEntry::new(EntryKind::HealthCheck, 1, None));
        let (tx, mut rx) = oneshot::channel();
        queue.push(PendingEntry::new(EntryKind::Reply, 1, Some(tx)));
        assert!(queue.has_health_check());

        queue.on_reply(RespValue::SimpleString("PONG".into()));
        queue.on_reply(RespValue::Integer(7));

        let batch = rx.try_recv().unwrap().unwrap();
        assert_eq!(batch.frames, vec![RespValue::Integer(7)]);
    }

    #[test]
    fn test_reauth_reply_is_swallowed() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp2);
        let (tx, mut rx) = oneshot::channel();
        queue.push(PendingEntry::new(EntryKind::Reply, 1, Some(tx)));
        queue.push(PendingEntry::new(EntryKind::Reauth, 1, None));
        assert_eq!(queue.head_kind(), Some(EntryKind::Reply));
        assert!(queue.has_reauth());

        queue.on_reply(RespValue::Error("NOAUTH Authentication required.".into()));
        assert_eq!(queue.head_kind(), Some(EntryKind::Reauth));
        queue.on_reply(RespValue::Error("WRONGPASS invalid password".into()));

        assert!(queue.is_empty());
        assert!(!queue.has_reauth());
        let batch = rx.try_recv().unwrap().unwrap();
        assert_eq!(batch.frames.len(), 1);
    }

    #[test]
    fn test_pubsub_entry_takes_acks_or_one_error() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp3);
        let (tx, mut rx) = oneshot::channel();
        queue.push(PendingEntry::new(EntryKind::PubSub, 2, Some(tx)));

        assert!(queue.on_ack(RespValue::Integer(1)));
        assert!(rx.try_recv().is_err());
        assert!(queue.on_ack(RespValue::Integer(2)));
        assert_eq!(rx.try_recv().unwrap().unwrap().frames.len(), 2);

        let (tx, mut rx) = oneshot::channel();
        queue.push(PendingEntry::new(EntryKind::PubSub, 3, Some(tx)));
        queue.on_reply(RespValue::Error("NOPERM no access".into()));
        assert_eq!(rx.try_recv().unwrap().unwrap().frames.len(), 1);

        // unsolicited acknowledgement with nothing waiting
        assert!(!queue.on_ack(RespValue::Integer(0)));
    }

    #[test]
    fn test_fail_all_drains() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp2);
        let (tx, mut rx) = oneshot::channel();
        queue.push(PendingEntry::new(EntryKind::Reply, 1, Some(tx)));
        queue.push(PendingEntry::new(EntryKind::HealthCheck, 1, None));

        let failed = queue.fail_all(|| RedisError::Connection("reset".into()));
        assert_eq!(failed, 2);
        assert!(queue.is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RedisError::Connection(_))
        ));
    }

    #[test]
    fn test_unmatched_reply() {
        let mut queue = CommandQueue::new(ProtocolVersion::Resp2);
        assert!(!queue.on_reply(RespValue::Integer(1)));
    }

    struct Recorder {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl PipelineExecutor for Recorder {
        async fn execute_pipeline(
            &self,
            commands: Vec<Command>,
        ) -> RedisResult<Vec<RedisResult<(RespValue, ProtocolVersion)>>> {
            let names = commands
                .iter()
                .map(|c| {
                    c.as_args()
                        .iter()
                        .map(|a| String::from_utf8_lossy(a).into_owned())
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            self.seen.lock().unwrap().push(names);
            Ok(commands
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    if i == 1 {
                        Ok((
                            RespValue::Error("WRONGTYPE bad".into()),
                            ProtocolVersion::Resp2,
                        ))
                    } else {
                        Ok((RespValue::from("v"), ProtocolVersion::Resp2))
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_pipeline_execute() {
        let recorder = Recorder {
            seen: Mutex::new(Vec::new()),
        };
        let mut pipeline = Pipeline::new(&recorder, TypeMapping::default());
        pipeline.set("a", "1").get("a").incr("n");
        assert_eq!(pipeline.len(), 3);

        let results = pipeline.execute().await.unwrap();
        assert!(pipeline.is_empty());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &RedisValue::String("v".into()));
        assert!(matches!(results[1], Err(RedisError::Server(_))));
        assert_eq!(
            recorder.seen.lock().unwrap()[0],
            vec!["SET a 1", "GET a", "INCR n"]
        );
    }
}
