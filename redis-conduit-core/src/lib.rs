//! Core types and traits for the redis-conduit Redis client
//!
//! This crate provides the wire values, caller-visible values, type mapping,
//! configuration and error definitions shared by the redis-conduit client.

#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod mapping;
pub mod types;
pub mod value;

pub use config::{ConnectionConfig, ProtocolVersion, ReconnectConfig, TopologyMode};
pub use credentials::{Credentials, CredentialsProvider, RetryPolicy, StaticCredentials};
pub use error::{ErrorKind, RedisError, RedisResult};
pub use mapping::TypeMapping;
pub use types::{NodeAddr, NodeInfo, RedisValue, SlotRange};
pub use value::RespValue;
