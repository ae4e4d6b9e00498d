//! String and generic key commands

use super::{
    boolean, integer, ok_reply, optional_string, optional_string_list, CommandSpec, Declaration,
    IntoArg, TypedCommand,
};
use std::time::Duration;

/// GET
pub static GET: Declaration<Option<String>> =
    Declaration::new(CommandSpec::new("GET").key(1).read_only(), optional_string);
/// MGET
pub static MGET: Declaration<Vec<Option<String>>> =
    Declaration::new(CommandSpec::new("MGET").keys(1).read_only(), optional_string_list);
/// SET
pub static SET: Declaration<()> = Declaration::new(CommandSpec::new("SET").key(1), ok_reply);
/// DEL
pub static DEL: Declaration<i64> = Declaration::new(CommandSpec::new("DEL").keys(1), integer);
/// EXISTS
pub static EXISTS: Declaration<i64> =
    Declaration::new(CommandSpec::new("EXISTS").keys(1).read_only(), integer);
/// INCR
pub static INCR: Declaration<i64> = Declaration::new(CommandSpec::new("INCR").key(1), integer);
/// INCRBY
pub static INCRBY: Declaration<i64> = Declaration::new(CommandSpec::new("INCRBY").key(1), integer);
/// DECR
pub static DECR: Declaration<i64> = Declaration::new(CommandSpec::new("DECR").key(1), integer);
/// EXPIRE
pub static EXPIRE: Declaration<bool> = Declaration::new(CommandSpec::new("EXPIRE").key(1), boolean);
/// TTL
pub static TTL: Declaration<i64> =
    Declaration::new(CommandSpec::new("TTL").key(1).read_only(), integer);

pub(crate) static SPECS: &[&CommandSpec] = &[
    &GET.spec,
    &MGET.spec,
    &SET.spec,
    &DEL.spec,
    &EXISTS.spec,
    &INCR.spec,
    &INCRBY.spec,
    &DECR.spec,
    &EXPIRE.spec,
    &TTL.spec,
];

/// Get the value of a key
pub fn get(key: impl IntoArg) -> TypedCommand<Option<String>> {
    GET.command().arg(key)
}

/// Get the values of several keys
pub fn mget<I, K>(keys: I) -> TypedCommand<Vec<Option<String>>>
where
    I: IntoIterator<Item = K>,
    K: IntoArg,
{
    MGET.command().args(keys)
}

/// Set a key to a value
pub fn set(key: impl IntoArg, value: impl IntoArg) -> TypedCommand<()> {
    SET.command().arg(key).arg(value)
}

/// Set a key to a value with an expiration (`SET key value EX seconds`)
pub fn set_ex(key: impl IntoArg, value: impl IntoArg, ttl: Duration) -> TypedCommand<()> {
    SET.command()
        .arg(key)
        .arg(value)
        .arg("EX")
        .arg(ttl.as_secs().max(1))
}

/// Delete keys, returning how many existed
pub fn del<I, K>(keys: I) -> TypedCommand<i64>
where
    I: IntoIterator<Item = K>,
    K: IntoArg,
{
    DEL.command().args(keys)
}

/// Count how many of the keys exist
pub fn exists<I, K>(keys: I) -> TypedCommand<i64>
where
    I: IntoIterator<Item = K>,
    K: IntoArg,
{
    EXISTS.command().args(keys)
}

/// Increment the integer stored at key by one
pub fn incr(key: impl IntoArg) -> TypedCommand<i64> {
    INCR.command().arg(key)
}

/// Increment the integer stored at key
pub fn incr_by(key: impl IntoArg, increment: i64) -> TypedCommand<i64> {
    INCRBY.command().arg(key).arg(increment)
}

/// Decrement the integer stored at key by one
pub fn decr(key: impl IntoArg) -> TypedCommand<i64> {
    DECR.command().arg(key)
}

/// Set a timeout on key; false if the key does not exist
pub fn expire(key: impl IntoArg, ttl: Duration) -> TypedCommand<bool> {
    EXPIRE.command().arg(key).arg(ttl.as_secs())
}

/// Remaining time to live in seconds (-1 without expiry, -2 when missing)
pub fn ttl(key: impl IntoArg) -> TypedCommand<i64> {
    TTL.command().arg(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;

    fn args_of<O>(command: TypedCommand<O>) -> Vec<String> {
        Command::from(command)
            .as_args()
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect()
    }

    #[test]
    fn test_set_ex_args() {
        assert_eq!(
            args_of(set_ex("k", "v", Duration::from_secs(10))),
            vec!["SET", "k", "v", "EX", "10"]
        );
    }

    #[test]
    fn test_routing_facts() {
        let command = get("user:{42}:name");
        assert_eq!(command.command().key(), Some(&b"user:{42}:name"[..]));
        assert!(command.command().is_read_only());
        assert!(!incr("counter").command().is_read_only());
    }

    #[test]
    fn test_del_multiple() {
        assert_eq!(args_of(del(["a", "b"])), vec!["DEL", "a", "b"]);
    }
}
