//! Command builders for Redis operations
//!
//! A command is described in two halves. [`Command`] is the wire form: the
//! name and argument byte strings, plus the routing facts the cluster layer
//! needs (which argument is the key, whether replicas may serve it). A
//! [`Declaration`] adds what the client needs to turn the reply into a typed
//! value: one reply transformer per protocol version and the RESP3
//! stability flag. Builder functions in the submodules combine the two into a
//! [`TypedCommand`].
//!
//! Every declaration is also listed in a registry keyed by command name, so
//! raw commands sent through [`Client::call`](crate::Client::call) are routed
//! the same way as typed ones.

pub mod hash;
pub mod keys;
pub mod server;
pub mod sorted_set;

pub use hash::{hdel, hget, hgetall, hlen, hmget, hset};
pub use keys::{decr, del, exists, expire, get, incr, incr_by, mget, set, set_ex, ttl};
pub use server::{
    cluster_info, cluster_slots, dbsize, echo, info, memory_stats, ping, publish, spublish,
};
pub use sorted_set::{zadd, zcard, zrange, zscore, zunionstore};

use crate::core::{
    config::ProtocolVersion,
    error::{RedisError, RedisResult},
    mapping::{format_double, TypeMapping},
    types::RedisValue,
    value::RespValue,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

/// Conversion into a single command argument
pub trait IntoArg {
    /// The argument bytes
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.into_bytes())
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(format_double(self).into_bytes())
    }
}

macro_rules! int_args {
    ($($t:ty),*) => {
        $(
            impl IntoArg for $t {
                fn into_arg(self) -> Bytes {
                    Bytes::from(self.to_string().into_bytes())
                }
            }
        )*
    };
}

int_args!(i32, i64, u8, u16, u32, u64, usize);

/// A command in wire form, with its routing facts
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
    first_key_index: Option<usize>,
    variadic_keys: bool,
    key_count_index: Option<usize>,
    is_read_only: bool,
}

impl Command {
    /// Start a command with no routing key.
    ///
    /// Multi-word names such as `CLUSTER SLOTS` become separate arguments.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            args: name.split_whitespace().map(IntoArg::into_arg).collect(),
            first_key_index: None,
            variadic_keys: false,
            key_count_index: None,
            is_read_only: false,
        }
    }

    /// Start a command from its declaration
    #[must_use]
    pub fn from_spec(spec: &CommandSpec) -> Self {
        Self {
            first_key_index: spec.first_key_index,
            variadic_keys: spec.variadic_keys,
            key_count_index: spec.key_count_index,
            is_read_only: spec.is_read_only,
            ..Self::new(spec.name)
        }
    }

    /// Build a command from raw arguments, taking routing facts from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Config`] when `args` is empty.
    pub fn from_args<I, A>(args: I) -> RedisResult<Self>
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        let args: Vec<Bytes> = args.into_iter().map(IntoArg::into_arg).collect();
        if args.is_empty() {
            return Err(RedisError::Config("empty command".to_string()));
        }
        let spec = lookup_args(&args);
        Ok(Self {
            args,
            first_key_index: spec.and_then(|s| s.first_key_index),
            variadic_keys: spec.is_some_and(|s| s.variadic_keys),
            key_count_index: spec.and_then(|s| s.key_count_index),
            is_read_only: spec.is_some_and(|s| s.is_read_only),
        })
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    /// Override which argument is the routing key
    #[must_use]
    pub const fn with_key_index(mut self, index: Option<usize>) -> Self {
        self.first_key_index = index;
        self
    }

    /// Mark the command as safe to run on a replica
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }

    /// The command name as sent, upper-cased for display and lookups
    #[must_use]
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
            .unwrap_or_default()
    }

    /// All arguments including the name
    #[must_use]
    pub fn as_args(&self) -> &[Bytes] {
        &self.args
    }

    /// Index of the routing key argument, if any
    #[must_use]
    pub const fn first_key_index(&self) -> Option<usize> {
        self.first_key_index
    }

    /// The routing key, if the command has one
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.first_key_index
            .and_then(|i| self.args.get(i))
            .map(|k| &k[..])
    }

    /// Every key argument.
    ///
    /// For `MGET`-style commands that is all arguments from the first key on.
    /// For `ZUNIONSTORE`-style commands it is the first key plus the keys
    /// announced by the count argument.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        let none: &[Bytes] = &[];
        let (lead, counted) = match (self.first_key_index, self.key_count_index) {
            (Some(first), Some(count_at)) if first < count_at => (
                self.args.get(first..=first).unwrap_or_default(),
                self.counted_keys(count_at),
            ),
            (Some(_), Some(count_at)) => (none, self.counted_keys(count_at)),
            (Some(first), None) if self.variadic_keys => {
                (self.args.get(first..).unwrap_or_default(), none)
            }
            (Some(first), None) => (self.args.get(first..=first).unwrap_or_default(), none),
            (None, _) => (none, none),
        };
        lead.iter().chain(counted).map(|k| &k[..])
    }

    /// The keys following a `numkeys` argument; a malformed count yields none
    fn counted_keys(&self, count_at: usize) -> &[Bytes] {
        let count = self
            .args
            .get(count_at)
            .and_then(|n| std::str::from_utf8(n).ok())
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        self.args
            .get(count_at + 1..)
            .map(|rest| &rest[..count.min(rest.len())])
            .unwrap_or_default()
    }

    /// Whether replicas may serve this command
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.is_read_only
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<_> = self
            .args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        f.debug_struct("Command")
            .field("args", &args)
            .field("first_key_index", &self.first_key_index)
            .field("key_count_index", &self.key_count_index)
            .field("is_read_only", &self.is_read_only)
            .finish()
    }
}

/// Static facts about a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Command name, space-separated for container commands
    pub name: &'static str,
    /// Argument index of the first key (the name is index 0)
    pub first_key_index: Option<usize>,
    /// Whether every argument from the first key on is a key
    pub variadic_keys: bool,
    /// Argument index holding the number of keys that directly follow it
    pub key_count_index: Option<usize>,
    /// Whether replicas may serve the command
    pub is_read_only: bool,
    /// Whether the RESP3 reply shape may still change between server versions
    pub unstable_resp3: bool,
}

impl CommandSpec {
    /// A keyless, write, stable command
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            first_key_index: None,
            variadic_keys: false,
            key_count_index: None,
            is_read_only: false,
            unstable_resp3: false,
        }
    }

    /// Set the first key index
    #[must_use]
    pub const fn key(mut self, index: usize) -> Self {
        self.first_key_index = Some(index);
        self
    }

    /// Every argument from `index` on is a key
    #[must_use]
    pub const fn keys(mut self, index: usize) -> Self {
        self.first_key_index = Some(index);
        self.variadic_keys = true;
        self
    }

    /// Argument `index` holds a key count and that many keys follow it.
    ///
    /// Without an earlier [`key`](Self::key) the first counted key routes.
    #[must_use]
    pub const fn counted_keys(mut self, index: usize) -> Self {
        self.key_count_index = Some(index);
        if self.first_key_index.is_none() {
            self.first_key_index = Some(index + 1);
        }
        self
    }

    /// Mark as read-only
    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Mark the RESP3 reply shape as unstable
    #[must_use]
    pub const fn unstable_resp3(mut self) -> Self {
        self.unstable_resp3 = true;
        self
    }
}

/// Turns a raw reply into a typed result
pub type ReplyTransform<O> = fn(RespValue, &TypeMapping) -> RedisResult<O>;

/// Reply transformers keyed by protocol version
pub struct ReplyShape<O> {
    /// Used for replies read from a RESP2 connection
    pub resp2: ReplyTransform<O>,
    /// Used for replies read from a RESP3 connection
    pub resp3: ReplyTransform<O>,
}

impl<O> ReplyShape<O> {
    /// The same transformer for both versions
    #[must_use]
    pub const fn uniform(transform: ReplyTransform<O>) -> Self {
        Self {
            resp2: transform,
            resp3: transform,
        }
    }

    /// Apply the transformer for `version`.
    ///
    /// Error frames never reach the transformer; they become errors here.
    ///
    /// # Errors
    ///
    /// Returns the server error carried by the frame or the transformer's error.
    pub fn apply(
        &self,
        version: ProtocolVersion,
        frame: RespValue,
        mapping: &TypeMapping,
    ) -> RedisResult<O> {
        let frame = frame.into_result()?;
        match version {
            ProtocolVersion::Resp2 => (self.resp2)(frame, mapping),
            ProtocolVersion::Resp3 => (self.resp3)(frame, mapping),
        }
    }
}

impl<O> Clone for ReplyShape<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for ReplyShape<O> {}

/// A command declaration: static facts plus reply shape
pub struct Declaration<O> {
    /// Static facts
    pub spec: CommandSpec,
    /// Reply transformers
    pub shape: ReplyShape<O>,
}

impl<O> Declaration<O> {
    /// Declare a command whose reply needs no version-specific handling
    #[must_use]
    pub const fn new(spec: CommandSpec, transform: ReplyTransform<O>) -> Self {
        Self {
            spec,
            shape: ReplyShape::uniform(transform),
        }
    }

    /// Declare a command with separate RESP2 and RESP3 transformers
    #[must_use]
    pub const fn versioned(
        spec: CommandSpec,
        resp2: ReplyTransform<O>,
        resp3: ReplyTransform<O>,
    ) -> Self {
        Self {
            spec,
            shape: ReplyShape { resp2, resp3 },
        }
    }

    /// Start a command from this declaration; arguments are appended by the builder
    #[must_use]
    pub fn command(&'static self) -> TypedCommand<O> {
        TypedCommand {
            command: Command::from_spec(&self.spec),
            spec: &self.spec,
            shape: self.shape,
            type_mapping: None,
        }
    }
}

/// A command ready to send, with the knowledge to decode its reply
pub struct TypedCommand<O> {
    command: Command,
    spec: &'static CommandSpec,
    shape: ReplyShape<O>,
    type_mapping: Option<TypeMapping>,
}

impl<O> TypedCommand<O> {
    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.command = self.command.arg(arg);
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.command = self.command.args(args);
        self
    }

    /// Use a different type mapping for this call only
    #[must_use]
    pub const fn with_type_mapping(mut self, mapping: TypeMapping) -> Self {
        self.type_mapping = Some(mapping);
        self
    }

    /// The wire form
    #[must_use]
    pub const fn command(&self) -> &Command {
        &self.command
    }

    /// Static facts
    #[must_use]
    pub const fn spec(&self) -> &'static CommandSpec {
        self.spec
    }

    /// The per-call type mapping override, if any
    #[must_use]
    pub const fn type_mapping(&self) -> Option<TypeMapping> {
        self.type_mapping
    }

    /// Fail unless this command may be sent under `requested`.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::UnstableCommand`] for an unstable command under
    /// RESP3 when `allow_unstable` is not set.
    pub fn check_stability(
        &self,
        requested: ProtocolVersion,
        allow_unstable: bool,
    ) -> RedisResult<()> {
        check_stability(self.spec, requested, allow_unstable)
    }

    /// Split into the wire form and the reply decoder
    #[must_use]
    pub fn into_parts(self) -> (Command, ReplyShape<O>, Option<TypeMapping>) {
        (self.command, self.shape, self.type_mapping)
    }
}

impl<O> From<TypedCommand<O>> for Command {
    fn from(typed: TypedCommand<O>) -> Self {
        typed.command
    }
}

impl<O> fmt::Debug for TypedCommand<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedCommand")
            .field("command", &self.command)
            .field("unstable_resp3", &self.spec.unstable_resp3)
            .finish()
    }
}

pub(crate) fn check_stability(
    spec: &CommandSpec,
    requested: ProtocolVersion,
    allow_unstable: bool,
) -> RedisResult<()> {
    if spec.unstable_resp3 && requested == ProtocolVersion::Resp3 && !allow_unstable {
        return Err(RedisError::UnstableCommand(spec.name.to_string()));
    }
    Ok(())
}

static REGISTRY: LazyLock<HashMap<&'static str, &'static CommandSpec>> = LazyLock::new(|| {
    keys::SPECS
        .iter()
        .chain(hash::SPECS)
        .chain(sorted_set::SPECS)
        .chain(server::SPECS)
        .map(|spec| (spec.name, *spec))
        .collect()
});

/// Look up a command declaration by name (case-insensitive, e.g. `get` or `cluster slots`)
#[must_use]
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    let normalized = name
        .split_whitespace()
        .map(str::to_ascii_uppercase)
        .collect::<Vec<_>>()
        .join(" ");
    REGISTRY.get(normalized.as_str()).copied()
}

/// Find the declaration for a raw argument list, trying two-word names first
fn lookup_args(args: &[Bytes]) -> Option<&'static CommandSpec> {
    let name = std::str::from_utf8(args.first()?).ok()?;
    if let Some(sub) = args.get(1).and_then(|s| std::str::from_utf8(s).ok()) {
        if let Some(spec) = lookup(&format!("{name} {sub}")) {
            return Some(spec);
        }
    }
    lookup(name)
}

/// Declaration for a raw argument list, used by the untyped call path
pub(crate) fn spec_for(command: &Command) -> Option<&'static CommandSpec> {
    lookup_args(command.as_args())
}

// Shared reply transformers

pub(crate) fn ok_reply(frame: RespValue, _: &TypeMapping) -> RedisResult<()> {
    match frame {
        RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
        other => Err(RedisError::UnexpectedResponse(format!("{:?}", other))),
    }
}

pub(crate) fn integer(frame: RespValue, _: &TypeMapping) -> RedisResult<i64> {
    frame.as_int()
}

pub(crate) fn boolean(frame: RespValue, _: &TypeMapping) -> RedisResult<bool> {
    bool::try_from(frame)
}

pub(crate) fn string(frame: RespValue, _: &TypeMapping) -> RedisResult<String> {
    frame.as_string()
}

pub(crate) fn optional_string(frame: RespValue, _: &TypeMapping) -> RedisResult<Option<String>> {
    if frame.is_null() {
        Ok(None)
    } else {
        frame.as_string().map(Some)
    }
}

pub(crate) fn optional_double(frame: RespValue, _: &TypeMapping) -> RedisResult<Option<f64>> {
    if frame.is_null() {
        Ok(None)
    } else {
        frame.as_double().map(Some)
    }
}

pub(crate) fn string_list(frame: RespValue, _: &TypeMapping) -> RedisResult<Vec<String>> {
    frame
        .into_array()?
        .into_iter()
        .map(|item| item.as_string())
        .collect()
}

pub(crate) fn optional_string_list(
    frame: RespValue,
    _: &TypeMapping,
) -> RedisResult<Vec<Option<String>>> {
    frame
        .into_array()?
        .into_iter()
        .map(|item| optional_string(item, &TypeMapping::default()))
        .collect()
}

/// The reply as a [`RedisValue`] under the active mapping
pub(crate) fn value(frame: RespValue, mapping: &TypeMapping) -> RedisResult<RedisValue> {
    mapping.apply(frame)
}

/// A RESP2 flat array of alternating keys and values, shaped like a RESP3 map
pub(crate) fn flat_pairs(frame: RespValue, mapping: &TypeMapping) -> RedisResult<RedisValue> {
    mapping.apply_pairs(frame.into_pairs()?)
}

/// The frame itself, for internal callers that parse it further
pub(crate) fn raw(frame: RespValue, _: &TypeMapping) -> RedisResult<RespValue> {
    Ok(frame)
}
