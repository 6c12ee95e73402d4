//! Per-node cluster runtime state
//!
//! The context owns the primary member list and the registered membership
//! listeners. It is shared between the membership scheme (which mutates it) and
//! the messaging layer and application code (which read it).

use crate::config::ClusterConfiguration;
use crate::error::{ClusterError, Result};
use crate::listener::{MembershipEvent, MembershipListener};
use crate::member::{ClusterMember, MemberId};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, RwLock};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Best-known view of the cluster for one node
pub struct ClusterContext {
    configuration: Arc<ClusterConfiguration>,
    domain: String,
    local_member: OnceLock<ClusterMember>,
    members: RwLock<Vec<ClusterMember>>,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    event_tx: broadcast::Sender<MembershipEvent>,
}

impl ClusterContext {
    /// Create a context for a built configuration
    pub fn new(configuration: Arc<ClusterConfiguration>) -> Result<Arc<Self>> {
        let domain = configuration.settings()?.domain.clone();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new(Self {
            configuration,
            domain,
            local_member: OnceLock::new(),
            members: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            event_tx,
        }))
    }

    pub fn configuration(&self) -> &Arc<ClusterConfiguration> {
        &self.configuration
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn local_member(&self) -> Option<&ClusterMember> {
        self.local_member.get()
    }

    /// Register this node's own member. Listeners are not notified.
    pub async fn register_local_member(&self, member: ClusterMember) -> Result<()> {
        if !member.is_in_domain(&self.domain) {
            return Err(ClusterError::invalid_state(format!(
                "Local member domain '{}' does not match cluster domain '{}'",
                member.domain, self.domain
            )));
        }

        self.local_member.set(member.clone()).map_err(|_| {
            ClusterError::invalid_state("Local member has already been registered")
        })?;

        let mut members = self.members.write().await;
        members.retain(|m| m.id != member.id);
        members.insert(0, member);
        Ok(())
    }

    /// Add a member to the primary member list.
    ///
    /// Returns `true` only when a new entry was created. Members of other
    /// domains are ignored. A known address announced under a new id replaces
    /// the stale entry.
    pub async fn add_member(&self, member: ClusterMember) -> bool {
        if !member.is_in_domain(&self.domain) {
            tracing::debug!(
                "Ignoring member {} from foreign domain (local domain {})",
                member,
                self.domain
            );
            return false;
        }

        let stale = {
            let mut members = self.members.write().await;
            if members.iter().any(|m| m == &member) {
                return false;
            }

            let local_id = self.local_member.get().map(|m| m.id);
            let (stale, kept): (Vec<_>, Vec<_>) = members.drain(..).partition(|m| {
                m.address == member.address && m.id != member.id && Some(m.id) != local_id
            });
            *members = kept;
            members.push(member.clone());
            stale
        };

        for old in stale {
            tracing::info!("Member {} was replaced by {}", old, member);
            self.notify(MembershipEvent::MemberDisappeared(old)).await;
        }
        tracing::info!("Member added: {}", member);
        self.notify(MembershipEvent::MemberAdded(member)).await;
        true
    }

    /// Remove a member by identity. The local member is never removed.
    pub async fn remove_member(&self, member: &ClusterMember) -> bool {
        if self.is_local(&member.id) {
            return false;
        }

        let removed = {
            let mut members = self.members.write().await;
            let before = members.len();
            members.retain(|m| m != member);
            before != members.len()
        };

        if removed {
            tracing::info!("Member removed: {}", member);
            self.notify(MembershipEvent::MemberDisappeared(member.clone()))
                .await;
        }
        removed
    }

    pub async fn remove_member_by_id(&self, id: &MemberId) -> Option<ClusterMember> {
        if self.is_local(id) {
            return None;
        }

        let removed = {
            let mut members = self.members.write().await;
            let index = members.iter().position(|m| &m.id == id)?;
            members.remove(index)
        };

        tracing::info!("Member removed: {}", removed);
        self.notify(MembershipEvent::MemberDisappeared(removed.clone()))
            .await;
        Some(removed)
    }

    /// Snapshot of the primary member list, local member first
    pub async fn get_primary_cluster_members(&self) -> Vec<ClusterMember> {
        self.members.read().await.clone()
    }

    /// Snapshot of every member except the local one
    pub async fn remote_members(&self) -> Vec<ClusterMember> {
        self.members
            .read()
            .await
            .iter()
            .filter(|m| !self.is_local(&m.id))
            .cloned()
            .collect()
    }

    pub async fn alive_member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn contains(&self, id: &MemberId) -> bool {
        self.members.read().await.iter().any(|m| &m.id == id)
    }

    pub async fn get_member(&self, id: &MemberId) -> Option<ClusterMember> {
        self.members.read().await.iter().find(|m| &m.id == id).cloned()
    }

    pub async fn member_by_address(&self, address: SocketAddr) -> Option<ClusterMember> {
        self.members
            .read()
            .await
            .iter()
            .find(|m| m.address == address)
            .cloned()
    }

    /// Whether any remote member is known
    pub async fn has_members(&self) -> bool {
        self.members
            .read()
            .await
            .iter()
            .any(|m| !self.is_local(&m.id))
    }

    /// The oldest member in the primary list
    pub async fn longest_living_member(&self) -> Option<ClusterMember> {
        let members = self.members.read().await;
        members
            .iter()
            .fold(None::<&ClusterMember>, |oldest, m| match oldest {
                Some(o) if o.is_older_than(m) => Some(o),
                _ => Some(m),
            })
            .cloned()
    }

    /// A random remote member
    pub async fn random_member(&self) -> Option<ClusterMember> {
        let remote = self.remote_members().await;
        remote.choose(&mut rand::thread_rng()).cloned()
    }

    /// Whether the local member is the oldest member of the cluster
    pub async fn is_coordinator(&self) -> bool {
        match (self.local_member(), self.longest_living_member().await) {
            (Some(local), Some(oldest)) => local == &oldest,
            _ => false,
        }
    }

    pub async fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Unregister a listener by `Arc` identity
    pub async fn remove_membership_listener(&self, listener: &Arc<dyn MembershipListener>) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        before != listeners.len()
    }

    /// Subscribe to membership events
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.event_tx.subscribe()
    }

    /// Drop every remote member without notifying listeners
    pub async fn clear(&self) {
        let mut members = self.members.write().await;
        members.retain(|m| self.is_local(&m.id));
    }

    fn is_local(&self, id: &MemberId) -> bool {
        self.local_member.get().map(|m| &m.id == id).unwrap_or(false)
    }

    async fn notify(&self, event: MembershipEvent) {
        let listeners = self.listeners.read().await.clone();

        for listener in &listeners {
            match &event {
                MembershipEvent::MemberAdded(member) => listener.member_added(member),
                MembershipEvent::MemberDisappeared(member) => listener.member_disappeared(member),
            }
        }

        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

fn same_listener(a: &Arc<dyn MembershipListener>, b: &Arc<dyn MembershipListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("domain", &self.domain)
            .field("local_member", &self.local_member.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{built_configuration, member_at};
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl MembershipListener for CountingListener {
        fn member_added(&self, _member: &ClusterMember) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn member_disappeared(&self, _member: &ClusterMember) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn context() -> Arc<ClusterContext> {
        ClusterContext::new(built_configuration("domain = \"test.domain\"\n")).unwrap()
    }

    #[test]
    fn test_context_requires_built_configuration() {
        let config = Arc::new(ClusterConfiguration::new());
        assert!(ClusterContext::new(config).is_err());
    }

    #[tokio::test]
    async fn test_add_member_is_idempotent() {
        let ctx = context();
        let member = member_at(4001, "test.domain");

        assert!(ctx.add_member(member.clone()).await);
        assert!(!ctx.add_member(member.clone()).await);
        assert_eq!(ctx.alive_member_count().await, 1);
        assert!(ctx.contains(&member.id).await);
    }

    #[tokio::test]
    async fn test_foreign_domain_ignored() {
        let ctx = context();
        assert!(!ctx.add_member(member_at(4001, "other.domain")).await);
        assert_eq!(ctx.alive_member_count().await, 0);
    }

    #[tokio::test]
    async fn test_local_member_counted_but_not_remote() {
        let ctx = context();
        let local = member_at(4000, "test.domain");
        ctx.register_local_member(local.clone()).await.unwrap();
        assert!(ctx.register_local_member(local.clone()).await.is_err());

        let remote = member_at(4001, "test.domain");
        ctx.add_member(remote.clone()).await;

        assert_eq!(ctx.alive_member_count().await, 2);
        assert_eq!(ctx.remote_members().await, vec![remote]);
        assert_eq!(ctx.get_primary_cluster_members().await[0], local);
        assert!(ctx.has_members().await);

        assert!(!ctx.remove_member(&local).await);
        assert!(ctx.remove_member_by_id(&local.id).await.is_none());

        ctx.clear().await;
        assert_eq!(ctx.get_primary_cluster_members().await, vec![local]);
        assert!(!ctx.has_members().await);
    }

    #[tokio::test]
    async fn test_listeners_notified() {
        let ctx = context();
        let counting = Arc::new(CountingListener::default());
        let listener: Arc<dyn MembershipListener> = counting.clone();
        ctx.add_membership_listener(listener.clone()).await;

        let mut events = ctx.subscribe();
        let member = member_at(4001, "test.domain");

        ctx.add_member(member.clone()).await;
        ctx.add_member(member.clone()).await;
        assert!(ctx.remove_member(&member).await);
        assert!(!ctx.remove_member(&member).await);

        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
        assert_eq!(counting.removed.load(Ordering::SeqCst), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::MemberAdded(member.clone())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            MembershipEvent::MemberDisappeared(member.clone())
        );

        assert!(ctx.remove_membership_listener(&listener).await);
        ctx.add_member(member).await;
        assert_eq!(counting.added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restarted_member_replaces_stale_entry() {
        let ctx = context();
        let old = member_at(4001, "test.domain");
        let restarted = member_at(4001, "test.domain");

        ctx.add_member(old.clone()).await;
        assert!(ctx.add_member(restarted.clone()).await);

        assert_eq!(ctx.alive_member_count().await, 1);
        assert!(!ctx.contains(&old.id).await);
        assert_eq!(ctx.member_by_address(old.address).await, Some(restarted));
    }

    #[tokio::test]
    async fn test_coordinator_is_oldest_member() {
        let ctx = context();
        let mut local = member_at(4000, "test.domain");
        let mut elder = member_at(4001, "test.domain");
        elder.started_at = local.started_at - Duration::seconds(10);
        local.started_at = elder.started_at + Duration::seconds(10);

        ctx.register_local_member(local.clone()).await.unwrap();
        assert!(ctx.is_coordinator().await);

        ctx.add_member(elder.clone()).await;
        assert!(!ctx.is_coordinator().await);
        assert_eq!(ctx.longest_living_member().await, Some(elder.clone()));
        assert_eq!(ctx.random_member().await, Some(elder));
    }
}
