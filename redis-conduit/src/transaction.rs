//! Transaction support for Redis
//!
//! A [`Transaction`] collects commands locally and sends `MULTI`, the queued
//! commands and `EXEC` as one pipelined batch. Nothing reaches the server
//! before [`Transaction::exec`] or [`Transaction::exec_typed`].
//!
//! # Examples
//!
//! ```no_run
//! use redis_conduit::{commands, Client, ConnectionConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConnectionConfig::new("redis://localhost:6379");
//! let client = Client::connect(config).await?;
//!
//! // Untyped: one generic value per command
//! let results = client
//!     .transaction()
//!     .add(commands::set("key1", "value1"))
//!     .add(commands::incr("counter"))
//!     .exec()
//!     .await?;
//! println!("Transaction results: {:?}", results);
//!
//! // Typed: a tuple shaped by each command's reply type
//! let ((), value) = client
//!     .transaction()
//!     .add(commands::set("key1", "value1"))
//!     .add(commands::get("key1"))
//!     .exec_typed()
//!     .await?;
//! assert_eq!(value.as_deref(), Some("value1"));
//! # Ok(())
//! # }
//! ```

use crate::commands::{Command, TypedCommand};
use crate::core::{
    config::ProtocolVersion,
    error::{RedisError, RedisResult},
    mapping::TypeMapping,
    types::RedisValue,
    value::RespValue,
};
use crate::pipeline::ReplyBatch;
use async_trait::async_trait;
use tracing::debug;

/// Runs a `MULTI ... EXEC` batch on a single connection
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    /// Write `commands` back-to-back on one connection and return every reply
    async fn execute_transaction(&self, commands: Vec<Command>) -> RedisResult<ReplyBatch>;
}

/// Grows a result tuple by one element
pub trait Append<O> {
    /// The tuple with `O` appended
    type Output;

    /// Append `value`
    fn append(self, value: O) -> Self::Output;
}

impl<O> Append<O> for () {
    type Output = (O,);

    fn append(self, value: O) -> Self::Output {
        (value,)
    }
}

macro_rules! append_tuple {
    ($($name:ident),+) => {
        impl<$($name,)+ O> Append<O> for ($($name,)+) {
            type Output = ($($name,)+ O,);

            #[allow(non_snake_case)]
            fn append(self, value: O) -> Self::Output {
                let ($($name,)+) = self;
                ($($name,)+ value,)
            }
        }
    };
}

append_tuple!(A);
append_tuple!(A, B);
append_tuple!(A, B, C);
append_tuple!(A, B, C, D);
append_tuple!(A, B, C, D, E);
append_tuple!(A, B, C, D, E, F);
append_tuple!(A, B, C, D, E, F, G);
append_tuple!(A, B, C, D, E, F, G, H);
append_tuple!(A, B, C, D, E, F, G, H, I);
append_tuple!(A, B, C, D, E, F, G, H, I, J);
append_tuple!(A, B, C, D, E, F, G, H, I, J, K);

type Frames = std::vec::IntoIter<RespValue>;
type Parser<T> =
    Box<dyn FnOnce(&mut Frames, ProtocolVersion, &TypeMapping) -> RedisResult<T> + Send>;

/// A Redis transaction that executes commands atomically
///
/// `T` is the tuple [`exec_typed`](Self::exec_typed) resolves to; every
/// [`add`](Self::add) appends the added command's reply type to it.
pub struct Transaction<'a, T = ()> {
    executor: &'a dyn TransactionExecutor,
    mapping: TypeMapping,
    commands: Vec<Command>,
    parser: Parser<T>,
}

impl<'a> Transaction<'a, ()> {
    /// Create an empty transaction
    pub fn new(executor: &'a dyn TransactionExecutor, mapping: TypeMapping) -> Self {
        Self {
            executor,
            mapping,
            commands: Vec::new(),
            parser: Box::new(|_, _, _| Ok(())),
        }
    }
}

impl<'a, T: Send + 'static> Transaction<'a, T> {
    /// Queue a command; its reply becomes the next element of the typed result
    #[must_use]
    pub fn add<O>(self, command: TypedCommand<O>) -> Transaction<'a, T::Output>
    where
        T: Append<O>,
        O: 'static,
    {
        let (command, shape, mapping_override) = command.into_parts();
        let Self {
            executor,
            mapping,
            mut commands,
            parser,
        } = self;
        let position = commands.len();
        commands.push(command);

        Transaction {
            executor,
            mapping,
            commands,
            parser: Box::new(move |frames, version, mapping| {
                let head = parser(frames, version, mapping)?;
                let frame = frames.next().ok_or_else(|| {
                    RedisError::Protocol(format!("Missing EXEC result at position {}", position))
                })?;
                let mapping = mapping_override.as_ref().unwrap_or(mapping);
                Ok(head.append(shape.apply(version, frame, mapping)?))
            }),
        }
    }

    /// Queue a SET
    #[must_use]
    pub fn set(
        self,
        key: impl crate::commands::IntoArg,
        value: impl crate::commands::IntoArg,
    ) -> Transaction<'a, T::Output>
    where
        T: Append<()>,
    {
        self.add(crate::commands::set(key, value))
    }

    /// Queue a GET
    #[must_use]
    pub fn get(self, key: impl crate::commands::IntoArg) -> Transaction<'a, T::Output>
    where
        T: Append<Option<String>>,
    {
        self.add(crate::commands::get(key))
    }

    /// Queue an INCR
    #[must_use]
    pub fn incr(self, key: impl crate::commands::IntoArg) -> Transaction<'a, T::Output>
    where
        T: Append<i64>,
    {
        self.add(crate::commands::incr(key))
    }

    /// Number of queued commands
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queued commands in order
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Execute and return one generic value per queued command
    ///
    /// Every reply goes through the transaction's type mapping.
    ///
    /// # Errors
    ///
    /// - [`RedisError::TransactionAborted`] when the server refused the batch
    ///   (`EXECABORT`, or a null `EXEC` reply after a watched key changed)
    /// - the first per-command error carried in the `EXEC` reply
    /// - connection and protocol errors from sending the batch
    pub async fn exec(self) -> RedisResult<Vec<RedisValue>> {
        let Some((frames, _)) = run(self.executor, self.commands).await? else {
            return Ok(Vec::new());
        };

        let mut values = Vec::with_capacity(frames.len());
        for (index, frame) in frames.into_iter().enumerate() {
            if let RespValue::Error(msg) = &frame {
                debug!("Transaction command {} failed: {}", index, msg);
                return Err(RedisError::from_server_message(msg));
            }
            values.push(self.mapping.apply(frame)?);
        }
        Ok(values)
    }

    /// Execute and shape each reply with its own command's reply type
    ///
    /// # Errors
    ///
    /// Same as [`exec`](Self::exec), plus conversion errors from the
    /// per-command reply transformers.
    pub async fn exec_typed(self) -> RedisResult<T> {
        let Self {
            executor,
            mapping,
            commands,
            parser,
        } = self;
        match run(executor, commands).await? {
            Some((frames, version)) => parser(&mut frames.into_iter(), version, &mapping),
            None => parser(&mut Vec::new().into_iter(), ProtocolVersion::Resp2, &mapping),
        }
    }

    /// Drop the queued commands without contacting the server
    pub fn discard(self) {
        debug!("Discarding transaction with {} queued commands", self.commands.len());
    }
}

/// Send `MULTI`, `commands` and `EXEC`, returning the `EXEC` results.
///
/// `None` means nothing was queued and nothing was sent.
async fn run(
    executor: &dyn TransactionExecutor,
    commands: Vec<Command>,
) -> RedisResult<Option<(Vec<RespValue>, ProtocolVersion)>> {
    if commands.is_empty() {
        return Ok(None);
    }

    let expected = commands.len();
    let mut batch = Vec::with_capacity(expected + 2);
    batch.push(Command::new("MULTI"));
    batch.extend(commands);
    batch.push(Command::new("EXEC"));

    let ReplyBatch { mut frames, version } = executor.execute_transaction(batch).await?;
    let exec_reply = frames
        .pop()
        .ok_or_else(|| RedisError::Protocol("Missing EXEC reply".to_string()))?;
    if let Some(RespValue::Error(msg)) = frames.first() {
        return Err(RedisError::from_server_message(msg));
    }

    match exec_reply {
        RespValue::Null => Err(RedisError::TransactionAborted(
            "EXEC returned null: a watched key was modified".to_string(),
        )),
        RespValue::Error(msg) => match RedisError::from_server_message(&msg) {
            aborted @ RedisError::TransactionAborted(_) => Err(aborted),
            other => Err(RedisError::TransactionAborted(other.to_string())),
        },
        reply => {
            let results = reply.into_array()?;
            if results.len() != expected {
                return Err(RedisError::Protocol(format!(
                    "EXEC returned {} results for {} commands",
                    results.len(),
                    expected
                )));
            }
            Ok(Some((results, version)))
        }
    }
}
