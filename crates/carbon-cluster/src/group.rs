//! Group management of application domains
//!
//! A node that fronts other clusters (a load balancer, for instance) tracks
//! the members of those application domains without admitting them to its own
//! primary member list. Each managed `(domain, sub-domain)` pair has one
//! [`GroupManagementAgent`]; the membership manager feeds the agents with the
//! foreign members it hears from and drops them when they leave or go silent.

use crate::member::{ClusterMember, MemberId};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Sub-domain of members and agents that do not name one
pub const DEFAULT_SUB_DOMAIN: &str = "__$default";

/// Member property naming the member's sub-domain
pub const SUB_DOMAIN_PROPERTY: &str = "subDomain";

/// Sub-domain a member advertises
pub fn sub_domain_of(member: &ClusterMember) -> &str {
    member
        .property(SUB_DOMAIN_PROPERTY)
        .unwrap_or(DEFAULT_SUB_DOMAIN)
}

/// Members of one application group
#[derive(Debug)]
pub struct GroupManagementAgent {
    domain: String,
    sub_domain: String,
    members: DashMap<MemberId, ClusterMember>,
}

impl GroupManagementAgent {
    /// Create an agent for `domain`; `None` selects the default sub-domain
    pub fn new<T: Into<String>>(domain: T, sub_domain: Option<&str>) -> Self {
        Self {
            domain: domain.into(),
            sub_domain: sub_domain.unwrap_or(DEFAULT_SUB_DOMAIN).to_string(),
            members: DashMap::new(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn sub_domain(&self) -> &str {
        &self.sub_domain
    }

    /// Record an application member. Returns `true` if it was not known.
    pub fn application_member_added(&self, member: &ClusterMember) -> bool {
        let added = self.members.insert(member.id, member.clone()).is_none();
        if added {
            tracing::info!(
                "Application member {} joined group {}/{}",
                member,
                self.domain,
                self.sub_domain
            );
        }
        added
    }

    pub fn application_member_removed(&self, id: &MemberId) -> Option<ClusterMember> {
        let (_, member) = self.members.remove(id)?;
        tracing::info!(
            "Application member {} left group {}/{}",
            member,
            self.domain,
            self.sub_domain
        );
        Some(member)
    }

    /// Current members, oldest first
    pub fn members(&self) -> Vec<ClusterMember> {
        let mut members: Vec<ClusterMember> =
            self.members.iter().map(|entry| entry.value().clone()).collect();
        members.sort_by_key(|m| m.started_at);
        members
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn clear(&self) {
        self.members.clear();
    }
}

/// The group management agents of one node, keyed by domain and sub-domain
#[derive(Debug, Default)]
pub struct GroupRegistry {
    agents: DashMap<(String, String), Arc<GroupManagementAgent>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any agent managing the same group
    pub fn add(&self, agent: Arc<GroupManagementAgent>) {
        tracing::info!(
            "Managing group application domain {}, sub-domain {}",
            agent.domain(),
            agent.sub_domain()
        );
        let key = (agent.domain().to_string(), agent.sub_domain().to_string());
        self.agents.insert(key, agent);
    }

    pub fn get(&self, domain: &str, sub_domain: Option<&str>) -> Option<Arc<GroupManagementAgent>> {
        let key = (
            domain.to_string(),
            sub_domain.unwrap_or(DEFAULT_SUB_DOMAIN).to_string(),
        );
        self.agents.get(&key).map(|agent| agent.value().clone())
    }

    /// Forget every member of a group; the agent stays registered.
    ///
    /// Returns `false` if no agent manages the group.
    pub fn reset(&self, domain: &str, sub_domain: Option<&str>) -> bool {
        match self.get(domain, sub_domain) {
            Some(agent) => {
                agent.clear();
                tracing::info!(
                    "Reset group management agent of {}/{}",
                    agent.domain(),
                    agent.sub_domain()
                );
                true
            }
            None => false,
        }
    }

    /// Managed application domains, sorted
    pub fn domains(&self) -> Vec<String> {
        self.agents
            .iter()
            .map(|entry| entry.key().0.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Route a sign of life from a foreign member to its group.
    ///
    /// Returns `false` when no agent manages the member's group.
    pub fn member_seen(&self, member: &ClusterMember) -> bool {
        match self.get(&member.domain, Some(sub_domain_of(member))) {
            Some(agent) => {
                agent.application_member_added(member);
                true
            }
            None => false,
        }
    }

    /// Drop a member from whichever group holds it
    pub fn member_disappeared(&self, id: &MemberId) -> Option<ClusterMember> {
        let agents: Vec<Arc<GroupManagementAgent>> =
            self.agents.iter().map(|entry| entry.value().clone()).collect();
        agents
            .iter()
            .find_map(|agent| agent.application_member_removed(id))
    }

    /// Forget the members of every group
    pub fn clear_members(&self) {
        for entry in self.agents.iter() {
            entry.value().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::member_at;
    use std::collections::HashMap;

    fn worker_at(port: u16, domain: &str) -> ClusterMember {
        member_at(port, domain).with_properties(HashMap::from([(
            SUB_DOMAIN_PROPERTY.to_string(),
            "worker".to_string(),
        )]))
    }

    #[test]
    fn test_agent_tracks_members() {
        let agent = GroupManagementAgent::new("app.domain", None);
        assert_eq!(agent.sub_domain(), DEFAULT_SUB_DOMAIN);

        let member = member_at(4001, "app.domain");
        assert!(agent.application_member_added(&member));
        assert!(!agent.application_member_added(&member));
        assert_eq!(agent.members(), vec![member.clone()]);

        assert_eq!(agent.application_member_removed(&member.id), Some(member.clone()));
        assert!(agent.application_member_removed(&member.id).is_none());
        assert!(agent.members().is_empty());
    }

    #[test]
    fn test_registry_routes_by_sub_domain() {
        let registry = GroupRegistry::new();
        registry.add(Arc::new(GroupManagementAgent::new("app.domain", None)));
        registry.add(Arc::new(GroupManagementAgent::new(
            "app.domain",
            Some("worker"),
        )));

        let manager_node = member_at(4001, "app.domain");
        let worker_node = worker_at(4002, "app.domain");
        let stranger = member_at(4003, "other.domain");

        assert!(registry.member_seen(&manager_node));
        assert!(registry.member_seen(&worker_node));
        assert!(!registry.member_seen(&stranger));

        let default_group = registry.get("app.domain", None).unwrap();
        let worker_group = registry.get("app.domain", Some("worker")).unwrap();
        assert_eq!(default_group.members(), vec![manager_node.clone()]);
        assert_eq!(worker_group.members(), vec![worker_node.clone()]);
        assert!(registry.get("other.domain", None).is_none());

        assert_eq!(registry.member_disappeared(&worker_node.id), Some(worker_node));
        assert!(worker_group.members().is_empty());
        assert_eq!(default_group.members().len(), 1);
    }

    #[test]
    fn test_reset_and_domains() {
        let registry = GroupRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.reset("app.domain", None));

        registry.add(Arc::new(GroupManagementAgent::new("b.domain", None)));
        registry.add(Arc::new(GroupManagementAgent::new("a.domain", None)));
        registry.add(Arc::new(GroupManagementAgent::new("a.domain", Some("worker"))));
        assert_eq!(registry.domains(), vec!["a.domain".to_string(), "b.domain".to_string()]);

        let member = member_at(4001, "a.domain");
        registry.member_seen(&member);
        assert!(registry.reset("a.domain", None));
        assert!(registry.get("a.domain", None).unwrap().members().is_empty());
        assert_eq!(registry.domains().len(), 2);
    }
}
