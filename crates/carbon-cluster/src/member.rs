//! Cluster member identity

use crate::error::{ClusterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use uuid::Uuid;

/// Unique identifier for a cluster member
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Create a new random member ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a member ID from its string form
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| ClusterError::protocol(format!("Invalid member ID: {}", e)))?;
        Ok(Self(uuid))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A peer node in the cluster
///
/// Two members are the same member when both their id and their address match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Process-lifetime unique identifier
    pub id: MemberId,

    /// Address of the member's cluster receiver
    pub address: SocketAddr,

    /// Cluster domain the member belongs to
    pub domain: String,

    /// When the member process joined the cluster
    pub started_at: DateTime<Utc>,

    /// Member properties advertised to peers
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl ClusterMember {
    /// Create a member with a fresh id
    pub fn new(address: SocketAddr, domain: String) -> Self {
        Self {
            id: MemberId::new(),
            address,
            domain,
            started_at: Utc::now(),
            properties: HashMap::new(),
        }
    }

    /// Create a member with a specific id
    pub fn with_id(id: MemberId, address: SocketAddr, domain: String) -> Self {
        let mut member = Self::new(address, domain);
        member.id = id;
        member
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_in_domain(&self, domain: &str) -> bool {
        self.domain == domain
    }

    /// Whether the advertised address is a loopback address
    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    /// Orders members by age, oldest first; ties are broken by id
    pub fn is_older_than(&self, other: &ClusterMember) -> bool {
        (self.started_at, self.id) < (other.started_at, other.id)
    }
}

impl PartialEq for ClusterMember {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for ClusterMember {}

impl Hash for ClusterMember {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member[id={}, address={}, domain={}]", self.id, self.address, self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashSet;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_member_id_creation() {
        let id1 = MemberId::new();
        let id2 = MemberId::new();

        assert_ne!(id1, id2);
        assert!(!id1.to_string().is_empty());
    }

    #[test]
    fn test_member_id_parse() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let id = MemberId::parse(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
        assert!(MemberId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_member_equality_uses_id_and_address() {
        let member = ClusterMember::new(addr(4000), "d".to_string());

        let same = ClusterMember::with_id(member.id, addr(4000), "d".to_string());
        assert_eq!(member, same);

        let moved = ClusterMember::with_id(member.id, addr(4001), "d".to_string());
        assert_ne!(member, moved);

        let mut set = HashSet::new();
        set.insert(member.clone());
        set.insert(same);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_member_age_ordering() {
        let mut older = ClusterMember::new(addr(4000), "d".to_string());
        let younger = ClusterMember::new(addr(4001), "d".to_string());
        older.started_at = younger.started_at - Duration::seconds(5);

        assert!(older.is_older_than(&younger));
        assert!(!younger.is_older_than(&older));
    }

    #[test]
    fn test_member_serialization() {
        let mut props = HashMap::new();
        props.insert("http_port".to_string(), "9763".to_string());
        let member = ClusterMember::new(addr(4000), "d".to_string()).with_properties(props);

        let serialized = serde_json::to_string(&member).unwrap();
        let deserialized: ClusterMember = serde_json::from_str(&serialized).unwrap();

        assert_eq!(member, deserialized);
        assert_eq!(deserialized.property("http_port"), Some("9763"));
        assert_eq!(deserialized.started_at, member.started_at);
    }
}
