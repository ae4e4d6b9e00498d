//! Command builders for Redis Sorted Set operations

use super::{
    integer, optional_double, string_list, CommandSpec, Declaration, IntoArg, TypedCommand,
};

/// ZADD
pub static ZADD: Declaration<i64> = Declaration::new(CommandSpec::new("ZADD").key(1), integer);
/// ZCARD
pub static ZCARD: Declaration<i64> =
    Declaration::new(CommandSpec::new("ZCARD").key(1).read_only(), integer);
/// ZSCORE; a bulk string under RESP2, a double under RESP3
pub static ZSCORE: Declaration<Option<f64>> =
    Declaration::new(CommandSpec::new("ZSCORE").key(1).read_only(), optional_double);
/// ZRANGE
pub static ZRANGE: Declaration<Vec<String>> =
    Declaration::new(CommandSpec::new("ZRANGE").key(1).read_only(), string_list);
/// ZUNIONSTORE
pub static ZUNIONSTORE: Declaration<i64> =
    Declaration::new(CommandSpec::new("ZUNIONSTORE").key(1).counted_keys(2), integer);

pub(crate) static SPECS: &[&CommandSpec] = &[
    &ZADD.spec,
    &ZCARD.spec,
    &ZSCORE.spec,
    &ZRANGE.spec,
    &ZUNIONSTORE.spec,
];

/// Add members with scores, returning how many were new
pub fn zadd<I, M>(key: impl IntoArg, members: I) -> TypedCommand<i64>
where
    I: IntoIterator<Item = (f64, M)>,
    M: IntoArg,
{
    let mut command = ZADD.command().arg(key);
    for (score, member) in members {
        command = command.arg(score).arg(member);
    }
    command
}

/// Number of members
pub fn zcard(key: impl IntoArg) -> TypedCommand<i64> {
    ZCARD.command().arg(key)
}

/// Score of a member
pub fn zscore(key: impl IntoArg, member: impl IntoArg) -> TypedCommand<Option<f64>> {
    ZSCORE.command().arg(key).arg(member)
}

/// Members by rank, inclusive on both ends
pub fn zrange(key: impl IntoArg, start: i64, stop: i64) -> TypedCommand<Vec<String>> {
    ZRANGE.command().arg(key).arg(start).arg(stop)
}

/// Store the union of `keys` in `destination`, optionally weighting each source
pub fn zunionstore<I, K>(
    destination: impl IntoArg,
    keys: I,
    weights: Option<&[f64]>,
) -> TypedCommand<i64>
where
    I: IntoIterator<Item = K>,
    K: IntoArg,
{
    let keys: Vec<_> = keys.into_iter().map(IntoArg::into_arg).collect();
    let mut command = ZUNIONSTORE
        .command()
        .arg(destination)
        .arg(keys.len())
        .args(keys);
    if let Some(weights) = weights {
        command = command.arg("WEIGHTS").args(weights.iter().copied());
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{config::ProtocolVersion, mapping::TypeMapping, value::RespValue};

    #[test]
    fn test_zscore_both_protocols() {
        let (_, shape, _) = zscore("z", "m").into_parts();
        let mapping = TypeMapping::default();
        assert_eq!(
            shape
                .apply(ProtocolVersion::Resp2, RespValue::from("1.5"), &mapping)
                .unwrap(),
            Some(1.5)
        );
        assert_eq!(
            shape
                .apply(ProtocolVersion::Resp3, RespValue::Double(1.5), &mapping)
                .unwrap(),
            Some(1.5)
        );
        assert_eq!(
            shape
                .apply(ProtocolVersion::Resp3, RespValue::Null, &mapping)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_zunionstore_without_weights() {
        let command = zunionstore("dest", ["a", "b"], None);
        let args: Vec<_> = command
            .command()
            .as_args()
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        assert_eq!(args, vec!["ZUNIONSTORE", "dest", "2", "a", "b"]);
    }
}
