//! Async Redis client core for Rust
//!
//! `redis-conduit` speaks RESP2 and RESP3 over multiplexed, pipelined
//! connections. It detects whether you're connecting to a standalone Redis
//! server or a Redis Cluster, and handles MOVED/ASK redirects transparently.
//!
//! # Features
//!
//! - RESP2/RESP3 codec with a resumable decoder and configurable type mapping
//! - One pipelined connection per node with FIFO reply matching
//! - Reconnection with exponential backoff, health probes and an offline queue
//! - Pub/Sub for channels, patterns and shard channels
//! - `MULTI`/`EXEC` transactions with untyped and typed results
//! - Cluster slot routing with hash tags and copy-on-write slot map refreshes
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_conduit::{Client, Commands, ConnectionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::new("redis://localhost:6379");
//!     let client = Client::connect(config).await?;
//!
//!     client.set("mykey", "myvalue").await?;
//!     let value: Option<String> = client.get("mykey").await?;
//!     println!("Value: {:?}", value);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::unnecessary_literal_bound)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::implicit_clone)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unnecessary_wraps)]
#![allow(clippy::unused_async)]

pub use redis_conduit_core as core;

pub mod client;
pub mod cluster;
pub mod commands;
pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod pubsub;
pub mod transaction;

pub use client::{Client, ClientView, Commands};
pub use cluster::{calculate_slot, SlotMap};
pub use commands::{Command, TypedCommand};
pub use connection::{Connection, ConnectionState, TopologyType};
pub use pipeline::Pipeline;
pub use pubsub::{PubSubKind, PubSubMessage, Subscriber, SubscriptionState};
pub use transaction::Transaction;

pub use crate::core::{
    config::{ConnectionConfig, ProtocolVersion, ReconnectConfig, TopologyMode},
    credentials::{Credentials, CredentialsProvider, StaticCredentials},
    error::{ErrorKind, RedisError, RedisResult},
    mapping::TypeMapping,
    types::{NodeAddr, NodeInfo, RedisValue, SlotRange},
    value::RespValue,
};
