//! Membership management shared by all membership schemes
//!
//! The manager applies inbound membership frames to the [`ClusterContext`],
//! answers join requests and pings, and drops members whose heartbeats have
//! stopped. Members of foreign domains never enter the context; they are
//! routed to the group management agents instead.

use crate::context::ClusterContext;
use crate::failure_detector::FailureDetector;
use crate::group::GroupRegistry;
use crate::member::{ClusterMember, MemberId};
use crate::messaging::MessageReceiver;
use crate::protocol::Frame;
use crate::transport::PeerClient;
use std::sync::Arc;
use std::time::Duration;

pub struct MembershipManager {
    context: Arc<ClusterContext>,
    local: ClusterMember,
    detector: FailureDetector,
    client: PeerClient,
    receiver: MessageReceiver,
    groups: Arc<GroupRegistry>,
    group_detector: FailureDetector,
}

impl MembershipManager {
    pub fn new(
        context: Arc<ClusterContext>,
        local: ClusterMember,
        client: PeerClient,
        receiver: MessageReceiver,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            context,
            local,
            detector: FailureDetector::new(heartbeat_timeout),
            client,
            receiver,
            groups: Arc::new(GroupRegistry::new()),
            group_detector: FailureDetector::new(heartbeat_timeout),
        }
    }

    /// Share the node's group management agents with this manager
    pub fn with_group_registry(mut self, groups: Arc<GroupRegistry>) -> Self {
        self.groups = groups;
        self
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.context
    }

    pub fn local_member(&self) -> &ClusterMember {
        &self.local
    }

    pub fn client(&self) -> &PeerClient {
        &self.client
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn receiver(&self) -> &MessageReceiver {
        &self.receiver
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Record a sign of life from `member`, adding it if unknown.
    ///
    /// Returns `true` when the member was newly added to the primary member
    /// list. Members of managed foreign groups are tracked there instead.
    pub async fn member_seen(&self, member: &ClusterMember) -> bool {
        if member.id == self.local.id {
            return false;
        }

        if !member.is_in_domain(self.context.domain()) {
            if self.groups.member_seen(member) {
                self.group_detector.heartbeat(member.id);
            }
            return false;
        }

        self.detector.heartbeat(member.id);
        self.context.add_member(member.clone()).await
    }

    /// Drop a member that left or stopped responding
    pub async fn member_disappeared(&self, id: &MemberId) -> Option<ClusterMember> {
        self.detector.forget(id);
        self.group_detector.forget(id);
        self.groups.member_disappeared(id);
        self.context.remove_member_by_id(id).await
    }

    /// Forget all liveness state and every group member
    pub fn forget_all(&self) {
        self.detector.clear();
        self.group_detector.clear();
        self.groups.clear_members();
    }

    /// Merge a member list received from a peer
    pub async fn merge(&self, members: &[ClusterMember]) -> usize {
        let mut added = 0;
        for member in members {
            if self.member_seen(member).await {
                added += 1;
            }
        }
        added
    }

    /// Drop every member whose heartbeats timed out
    pub async fn sweep(&self) -> Vec<ClusterMember> {
        let mut dropped = Vec::new();
        for id in self.detector.expired() {
            if let Some(member) = self.member_disappeared(&id).await {
                tracing::warn!(
                    "Member {} has not responded for {:?}, removing it",
                    member,
                    self.detector.timeout()
                );
                dropped.push(member);
            }
        }

        for id in self.group_detector.expired() {
            self.group_detector.forget(&id);
            if let Some(member) = self.groups.member_disappeared(&id) {
                tracing::warn!("Application member {} stopped responding", member);
            }
        }
        dropped
    }

    /// Apply an inbound frame, returning the reply if the frame expects one
    pub async fn handle(self: &Arc<Self>, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::Heartbeat { sender } => {
                self.member_seen(&sender).await;
                None
            }
            Frame::Ping { sender } => {
                if !sender.is_in_domain(self.context.domain()) {
                    self.member_seen(&sender).await;
                    return Some(self.domain_mismatch(&sender));
                }
                self.member_seen(&sender).await;
                Some(self.ack(None))
            }
            Frame::Join { sender } => {
                if !sender.is_in_domain(self.context.domain()) {
                    tracing::warn!("Rejecting join from {}: domain mismatch", sender);
                    self.member_seen(&sender).await;
                    return Some(self.domain_mismatch(&sender));
                }

                if self.member_seen(&sender).await {
                    tracing::info!("Member {} joined through this node", sender);
                    self.announce_joined(sender);
                }

                Some(Frame::MemberList {
                    sender: self.local.clone(),
                    members: self.context.get_primary_cluster_members().await,
                })
            }
            Frame::MemberList { sender, members } => {
                self.member_seen(&sender).await;
                self.merge(&members).await;
                None
            }
            Frame::MemberJoined { sender, member } => {
                self.member_seen(&sender).await;
                self.member_seen(&member).await;
                Some(self.ack(None))
            }
            Frame::Leave { sender } => {
                if sender.id != self.local.id {
                    if let Some(member) = self.member_disappeared(&sender.id).await {
                        tracing::info!("Member {} left the cluster", member);
                    }
                }
                None
            }
            Frame::Application { sender, message } => {
                if !sender.is_in_domain(self.context.domain()) {
                    return Some(self.domain_mismatch(&sender));
                }
                if self.context.contains(&sender.id).await {
                    self.detector.heartbeat(sender.id);
                }
                Some(self.receiver.receive(&sender, message).await)
            }
            Frame::Ack { .. } | Frame::Nack { .. } => None,
        }
    }

    /// Tell every other member about a member that joined through this node
    fn announce_joined(self: &Arc<Self>, joined: ClusterMember) {
        let manager = self.clone();
        tokio::spawn(async move {
            let frame = Frame::MemberJoined {
                sender: manager.local.clone(),
                member: joined.clone(),
            };
            let targets: Vec<ClusterMember> = manager
                .context
                .remote_members()
                .await
                .into_iter()
                .filter(|m| m.id != joined.id)
                .collect();

            let sends = targets.iter().map(|target| {
                let manager = &manager;
                let frame = &frame;
                let joined = &joined;
                async move {
                    if let Err(e) = manager.client.request(target.address, frame).await {
                        tracing::debug!("Could not announce {} to {}: {}", joined.id, target, e);
                    }
                }
            });
            futures::future::join_all(sends).await;
        });
    }

    fn ack(&self, message_id: Option<uuid::Uuid>) -> Frame {
        Frame::Ack {
            sender: self.local.clone(),
            message_id,
            response: None,
        }
    }

    fn domain_mismatch(&self, sender: &ClusterMember) -> Frame {
        Frame::Nack {
            sender: self.local.clone(),
            message_id: None,
            reason: format!(
                "Domain mismatch: {} is not in domain {}",
                sender.domain,
                self.context.domain()
            ),
        }
    }
}

impl std::fmt::Debug for MembershipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipManager")
            .field("local", &self.local)
            .field("detector", &self.detector)
            .field("groups", &self.groups.domains())
            .finish_non_exhaustive()
    }
}
