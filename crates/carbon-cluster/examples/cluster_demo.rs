//! Cluster membership and messaging demonstration
//!
//! Starts two well-known-address members in one process, waits for them to
//! see each other, sends a message from the first to the second and shuts
//! both down.

use async_trait::async_trait;
use carbon_cluster::{
    ClusterConfiguration, ClusterContext, ClusterMember, ClusterMessage, ClusteringAgent,
    LoggingMembershipListener, MessageHandler,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Prints every message it executes
struct PrintingHandler {
    node: &'static str,
}

#[async_trait]
impl MessageHandler for PrintingHandler {
    async fn execute(
        &self,
        message: &mut ClusterMessage,
        sender: &ClusterMember,
    ) -> carbon_cluster::Result<()> {
        println!(
            "📨 {} executed '{}' from {}: {}",
            self.node, message.topic, sender.address, message.payload
        );
        message.mark_executed(format!("Executed by {}", self.node));
        Ok(())
    }
}

fn topology(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("resources")
        .join(name)
}

async fn start_node(
    name: &'static str,
    file: &str,
) -> Result<ClusteringAgent, Box<dyn std::error::Error>> {
    let mut configuration = ClusterConfiguration::new();
    configuration.set_configuration_source_location(topology(file));
    configuration.build()?;

    let context = ClusterContext::new(Arc::new(configuration))?;
    context
        .add_membership_listener(Arc::new(LoggingMembershipListener))
        .await;

    let agent = ClusteringAgent::with_message_handler(Arc::new(PrintingHandler { node: name }));
    agent.init(context).await?;
    Ok(agent)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("🚀 Starting Carbon Cluster Demo");

    let node1 = start_node("node-1", "cluster-03.toml").await?;
    let node2 = start_node("node-2", "cluster-04.toml").await?;

    // Wait for both members to see each other
    sleep(Duration::from_secs(1)).await;

    for (name, agent) in [("node-1", &node1), ("node-2", &node2)] {
        println!(
            "📊 {} sees {} member(s), coordinator: {}",
            name,
            agent.get_alive_member_count().await,
            agent.is_coordinator().await
        );
        for member in agent.get_members().await {
            println!("   {}", member);
        }
    }

    let message = ClusterMessage::new(
        "cache.invalidate",
        serde_json::json!({"cache": "registry", "keys": ["/_system/config"]}),
    );
    match node1.send_message(&message).await {
        Ok(report) => println!("✅ Delivered to {} member(s)", report.delivered.len()),
        Err(e) => println!("❌ {}", e),
    }

    if let Some(received) = node2.received_message(&message.id) {
        println!(
            "🔖 Execution marker on node-2: {}",
            received.execution_marker().unwrap_or("none")
        );
    }

    node2.shutdown().await;
    node1.shutdown().await;
    println!("👋 Demo finished");

    Ok(())
}
