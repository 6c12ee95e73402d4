//! Membership change notification

use crate::member::ClusterMember;
use serde::{Deserialize, Serialize};

/// Callback invoked when the primary member list changes.
///
/// Listeners are called after the member list lock has been released, so they
/// may query the context or register further listeners.
pub trait MembershipListener: Send + Sync {
    fn member_added(&self, member: &ClusterMember);

    fn member_disappeared(&self, member: &ClusterMember);
}

/// Membership change published on the context's event channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipEvent {
    MemberAdded(ClusterMember),
    MemberDisappeared(ClusterMember),
}

impl MembershipEvent {
    pub fn member(&self) -> &ClusterMember {
        match self {
            Self::MemberAdded(member) | Self::MemberDisappeared(member) => member,
        }
    }
}

/// Listener that logs every membership change
#[derive(Debug, Default)]
pub struct LoggingMembershipListener;

impl MembershipListener for LoggingMembershipListener {
    fn member_added(&self, member: &ClusterMember) {
        tracing::info!("Member {} joined the cluster", member);
    }

    fn member_disappeared(&self, member: &ClusterMember) {
        tracing::info!("Member {} left the cluster", member);
    }
}
