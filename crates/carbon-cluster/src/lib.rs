//! Carbon Cluster
//!
//! Cluster membership and messaging for Carbon nodes: peer discovery through
//! multicast heartbeats or well-known seed addresses, a live view of the
//! cluster membership, and cluster-wide message delivery with per-member
//! failure reporting.
//!
//! ```no_run
//! use carbon_cluster::{ClusterConfiguration, ClusterContext, ClusterMessage, ClusteringAgent};
//! use std::sync::Arc;
//!
//! # async fn run() -> carbon_cluster::Result<()> {
//! let mut configuration = ClusterConfiguration::new();
//! configuration.set_configuration_source_location("conf/cluster.toml");
//! configuration.build()?;
//!
//! let context = ClusterContext::new(Arc::new(configuration))?;
//! let agent = ClusteringAgent::new();
//! agent.init(context).await?;
//!
//! let message = ClusterMessage::new("cache.invalidate", serde_json::json!({"cache": "registry"}));
//! agent.send_message(&message).await?;
//!
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod failure_detector;
pub mod group;
pub mod listener;
pub mod member;
pub mod membership;
pub mod message;
pub mod messaging;
pub mod multicast;
pub mod protocol;
pub mod scheme;
pub mod transport;
pub mod wka;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{AgentState, ClusteringAgent};
pub use config::{ClusterConfiguration, ClusterSettings};
pub use context::ClusterContext;
pub use error::{
    ClusterError, DeliveryFailure, DeliveryFailureKind, MessageFailure, Result,
};
pub use group::{GroupManagementAgent, GroupRegistry, DEFAULT_SUB_DOMAIN};
pub use listener::{LoggingMembershipListener, MembershipEvent, MembershipListener};
pub use member::{ClusterMember, MemberId};
pub use message::{
    ClusterMessage, LoggingMessageHandler, MemberResponse, MessageHandler, EXECUTED,
};
pub use messaging::DeliveryReport;
pub use scheme::{MembershipScheme, MembershipSchemeKind, SchemeState};
