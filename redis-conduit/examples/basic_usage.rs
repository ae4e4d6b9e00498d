//! Tour of the client against a local server
//!
//! Run with `cargo run --example basic_usage`; set `REDIS_URL` to point
//! somewhere other than `redis://localhost:6379`, and `RUST_LOG=debug` to
//! watch the connection manager.

use redis_conduit::core::mapping::MapRepr;
use redis_conduit::{
    commands, Client, Commands, ConnectionConfig, ProtocolVersion, ReconnectConfig, TypeMapping,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let config = ConnectionConfig::new(url)
        .with_protocol(ProtocolVersion::Resp3)
        .with_client_name("conduit-demo")
        .with_reconnect(ReconnectConfig {
            max_delay: Duration::from_secs(5),
            ..ReconnectConfig::default()
        });

    let client = Client::connect(config).await?;
    println!(
        "Connected to a {:?} deployment over {}",
        client.topology_type(),
        client.protocol().await
    );

    // Plain commands
    client.set("demo:greeting", "hello").await?;
    println!("GET demo:greeting = {:?}", client.get("demo:greeting").await?);
    println!("INCR demo:visits = {}", client.incr("demo:visits").await?);

    // Hashes come back as records, or as maps through a view
    client
        .hset("demo:user", [("name", "ada"), ("lang", "rust")])
        .await?;
    println!("HGETALL = {:?}", client.hgetall("demo:user").await?);
    let as_map = client.with_type_mapping(TypeMapping::default().with_map(MapRepr::Map));
    println!("HGETALL (map view) = {:?}", as_map.hgetall("demo:user").await?);

    // Pipelines keep per-command errors apart
    let mut pipeline = client.pipeline();
    pipeline.set("demo:a", "1").incr("demo:a").get("demo:a");
    for (i, result) in pipeline.execute().await?.into_iter().enumerate() {
        println!("pipeline[{}] = {:?}", i, result);
    }

    // Transactions with typed results
    let (visits, greeting) = client
        .transaction()
        .incr("demo:visits")
        .get("demo:greeting")
        .exec_typed()
        .await?;
    println!("MULTI/EXEC -> visits={} greeting={:?}", visits, greeting);

    // Pub/Sub
    let mut subscriber = client.subscriber();
    subscriber.subscribe(["demo:news"]).await?;
    client.publish("demo:news", "subscribed and listening").await?;
    if let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_secs(1), subscriber.next_message()).await
    {
        println!("{} -> {}", message.channel, message.payload_str());
    }

    // Unstable RESP3 replies need an explicit opt-in
    match client.execute(commands::memory_stats()).await {
        Ok(stats) => println!("MEMORY STATS = {:?}", stats),
        Err(e) => println!("MEMORY STATS refused: {}", e),
    }

    client
        .del(["demo:greeting", "demo:visits", "demo:user", "demo:a"])
        .await?;
    client.quit().await;
    Ok(())
}
