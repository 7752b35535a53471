use anyhow::{Context, Result};
use chat_consistency::domain::{CHAT_MESSAGE_TOPIC, CHAT_ROOM_TOPIC};
use chat_consistency::infrastructure::config::AppConfig;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;

/// Creates the chat event topics, named with the configured prefix.
#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();
    let partitions: i32 = std::env::var("TOPIC_PARTITIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3);

    let admin_client: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka.bootstrap_servers)
        .create()
        .context("Failed to create admin client")?;

    let names: Vec<String> = [CHAT_ROOM_TOPIC, CHAT_MESSAGE_TOPIC]
        .iter()
        .map(|t| config.kafka.topic_name(t))
        .collect();
    let topics: Vec<NewTopic> = names
        .iter()
        .map(|name| NewTopic::new(name, partitions, TopicReplication::Fixed(1)))
        .collect();

    let results = admin_client
        .create_topics(&topics, &AdminOptions::new())
        .await
        .context("Failed to create topics")?;

    for result in results {
        match result {
            Ok(topic) => println!("Created topic: {}", topic),
            Err((topic, e)) => println!("Failed to create topic {}: {}", topic, e),
        }
    }
    Ok(())
}
