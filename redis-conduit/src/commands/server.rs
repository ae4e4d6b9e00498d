//! Connection, server and cluster introspection commands

use super::{integer, raw, string, value, CommandSpec, Declaration, IntoArg, TypedCommand};
use crate::core::{types::RedisValue, value::RespValue};

/// PING
pub static PING: Declaration<String> = Declaration::new(CommandSpec::new("PING"), string);
/// ECHO
pub static ECHO: Declaration<String> = Declaration::new(CommandSpec::new("ECHO"), string);
/// PUBLISH
pub static PUBLISH: Declaration<i64> = Declaration::new(CommandSpec::new("PUBLISH"), integer);
/// SPUBLISH; the shard channel doubles as the routing key
pub static SPUBLISH: Declaration<i64> =
    Declaration::new(CommandSpec::new("SPUBLISH").key(1), integer);
/// DBSIZE
pub static DBSIZE: Declaration<i64> =
    Declaration::new(CommandSpec::new("DBSIZE").read_only(), integer);
/// INFO
pub static INFO: Declaration<String> =
    Declaration::new(CommandSpec::new("INFO").read_only(), string);
/// CLUSTER SLOTS
pub static CLUSTER_SLOTS: Declaration<RespValue> =
    Declaration::new(CommandSpec::new("CLUSTER SLOTS"), raw);
/// CLUSTER INFO
pub static CLUSTER_INFO: Declaration<String> =
    Declaration::new(CommandSpec::new("CLUSTER INFO"), string);
/// MEMORY STATS; its RESP3 map layout is not frozen across server releases
pub static MEMORY_STATS: Declaration<RedisValue> = Declaration::versioned(
    CommandSpec::new("MEMORY STATS").read_only().unstable_resp3(),
    super::flat_pairs,
    value,
);

pub(crate) static SPECS: &[&CommandSpec] = &[
    &PING.spec,
    &ECHO.spec,
    &PUBLISH.spec,
    &SPUBLISH.spec,
    &DBSIZE.spec,
    &INFO.spec,
    &CLUSTER_SLOTS.spec,
    &CLUSTER_INFO.spec,
    &MEMORY_STATS.spec,
];

/// Ping the server
pub fn ping() -> TypedCommand<String> {
    PING.command()
}

/// Echo a message back
pub fn echo(message: impl IntoArg) -> TypedCommand<String> {
    ECHO.command().arg(message)
}

/// Publish a message, returning how many subscribers received it
pub fn publish(channel: impl IntoArg, message: impl IntoArg) -> TypedCommand<i64> {
    PUBLISH.command().arg(channel).arg(message)
}

/// Publish to a shard channel; routed by the channel's slot in a cluster
pub fn spublish(channel: impl IntoArg, message: impl IntoArg) -> TypedCommand<i64> {
    SPUBLISH.command().arg(channel).arg(message)
}

/// Number of keys in the selected database
pub fn dbsize() -> TypedCommand<i64> {
    DBSIZE.command()
}

/// Server information, optionally limited to one section
pub fn info(section: Option<&str>) -> TypedCommand<String> {
    let command = INFO.command();
    match section {
        Some(section) => command.arg(section),
        None => command,
    }
}

/// The cluster slot layout as reported by the node
pub fn cluster_slots() -> TypedCommand<RespValue> {
    CLUSTER_SLOTS.command()
}

/// Cluster state summary
pub fn cluster_info() -> TypedCommand<String> {
    CLUSTER_INFO.command()
}

/// Memory usage report
pub fn memory_stats() -> TypedCommand<RedisValue> {
    MEMORY_STATS.command()
}
