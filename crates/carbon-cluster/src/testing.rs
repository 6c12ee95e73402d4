//! Shared fixtures for unit tests

use crate::config::ClusterConfiguration;
use crate::context::ClusterContext;
use crate::member::ClusterMember;
use crate::membership::MembershipManager;
use crate::message::{LoggingMessageHandler, ReceivedMessages};
use crate::messaging::MessageReceiver;
use crate::transport::PeerClient;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Build a configuration from an inline TOML body
pub(crate) fn built_configuration(body: &str) -> Arc<ClusterConfiguration> {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(body.as_bytes()).unwrap();
    Arc::new(ClusterConfiguration::from_source(file.path()).unwrap())
}

pub(crate) fn member_at(port: u16, domain: &str) -> ClusterMember {
    ClusterMember::new(
        format!("127.0.0.1:{}", port).parse().unwrap(),
        domain.to_string(),
    )
}

/// Membership manager of a registered local member on port 4000
pub(crate) async fn membership_manager(domain: &str) -> Arc<MembershipManager> {
    let context =
        ClusterContext::new(built_configuration(&format!("domain = \"{}\"\n", domain))).unwrap();
    let local = member_at(4000, domain);
    context.register_local_member(local.clone()).await.unwrap();

    let receiver = MessageReceiver::new(
        local.clone(),
        Arc::new(LoggingMessageHandler),
        Arc::new(ReceivedMessages::new()),
    );
    Arc::new(MembershipManager::new(
        context,
        local,
        PeerClient::new(Duration::from_millis(100), Duration::from_millis(100)),
        receiver,
        Duration::from_secs(3),
    ))
}
