//! Hash commands for Redis
//!
//! `HGETALL` is the one reply here whose shape differs by protocol: RESP2
//! sends a flat array of alternating fields and values, RESP3 sends a map.
//! Both are handed to the active type mapping as key/value pairs, so the
//! caller sees the same representation either way.

use super::{
    flat_pairs, integer, optional_string, optional_string_list, value, CommandSpec, Declaration,
    IntoArg, TypedCommand,
};
use crate::core::types::RedisValue;

/// HGET
pub static HGET: Declaration<Option<String>> =
    Declaration::new(CommandSpec::new("HGET").key(1).read_only(), optional_string);
/// HMGET
pub static HMGET: Declaration<Vec<Option<String>>> =
    Declaration::new(CommandSpec::new("HMGET").key(1).read_only(), optional_string_list);
/// HSET
pub static HSET: Declaration<i64> = Declaration::new(CommandSpec::new("HSET").key(1), integer);
/// HDEL
pub static HDEL: Declaration<i64> = Declaration::new(CommandSpec::new("HDEL").key(1), integer);
/// HLEN
pub static HLEN: Declaration<i64> =
    Declaration::new(CommandSpec::new("HLEN").key(1).read_only(), integer);
/// HGETALL
pub static HGETALL: Declaration<RedisValue> = Declaration::versioned(
    CommandSpec::new("HGETALL").key(1).read_only(),
    flat_pairs,
    value,
);

pub(crate) static SPECS: &[&CommandSpec] = &[
    &HGET.spec,
    &HMGET.spec,
    &HSET.spec,
    &HDEL.spec,
    &HLEN.spec,
    &HGETALL.spec,
];

/// Get the value of a hash field
pub fn hget(key: impl IntoArg, field: impl IntoArg) -> TypedCommand<Option<String>> {
    HGET.command().arg(key).arg(field)
}

/// Get the values of several hash fields
pub fn hmget<I, F>(key: impl IntoArg, fields: I) -> TypedCommand<Vec<Option<String>>>
where
    I: IntoIterator<Item = F>,
    F: IntoArg,
{
    HMGET.command().arg(key).args(fields)
}

/// Set hash fields, returning how many were added
pub fn hset<I, F, V>(key: impl IntoArg, pairs: I) -> TypedCommand<i64>
where
    I: IntoIterator<Item = (F, V)>,
    F: IntoArg,
    V: IntoArg,
{
    let mut command = HSET.command().arg(key);
    for (field, value) in pairs {
        command = command.arg(field).arg(value);
    }
    command
}

/// Delete hash fields
pub fn hdel<I, F>(key: impl IntoArg, fields: I) -> TypedCommand<i64>
where
    I: IntoIterator<Item = F>,
    F: IntoArg,
{
    HDEL.command().arg(key).args(fields)
}

/// Number of fields in a hash
pub fn hlen(key: impl IntoArg) -> TypedCommand<i64> {
    HLEN.command().arg(key)
}

/// All fields and values of a hash, shaped by the active type mapping
pub fn hgetall(key: impl IntoArg) -> TypedCommand<RedisValue> {
    HGETALL.command().arg(key)
}
