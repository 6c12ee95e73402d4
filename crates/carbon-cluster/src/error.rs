//! Cluster error types

use crate::member::ClusterMember;
use crate::message::MemberResponse;
use std::fmt;
use std::net::AddrParseError;
use uuid::Uuid;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The topology description is missing, malformed or invalid
    #[error("Cluster configuration error: {0}")]
    Configuration(String),

    /// The membership scheme could not bind its resources or reach a seed
    #[error("Cluster initialization failed: {0}")]
    Initialization(String),

    /// One or more deliveries of a cluster message failed
    #[error("{0}")]
    MessageFailed(Box<MessageFailure>),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Cluster not initialized")]
    NotInitialized,

    #[error("Invalid cluster state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] AddrParseError),
}

impl ClusterError {
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn initialization<T: Into<String>>(msg: T) -> Self {
        Self::Initialization(msg.into())
    }

    pub fn network<T: Into<String>>(msg: T) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn timeout<T: Into<String>>(msg: T) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state<T: Into<String>>(msg: T) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn message_failed(failure: MessageFailure) -> Self {
        Self::MessageFailed(Box::new(failure))
    }

    /// Returns the delivery failure details if this is a `MessageFailed` error
    pub fn message_failure(&self) -> Option<&MessageFailure> {
        match self {
            Self::MessageFailed(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_initialization(&self) -> bool {
        matches!(self, Self::Initialization(_))
    }
}

impl From<config::ConfigError> for ClusterError {
    fn from(err: config::ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Why a single delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureKind {
    /// Failed on the sending node before anything hit the wire
    Local,
    /// Target is not (or no longer) part of the primary member list
    UnknownMember,
    /// Connection or transport error after all retries
    Unreachable,
    /// The per-target deadline elapsed
    Timeout,
    /// The target answered but refused or failed to execute the message
    Rejected,
}

impl DeliveryFailureKind {
    /// Whether the failure happened on the remote side of the exchange
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local | Self::UnknownMember)
    }
}

impl fmt::Display for DeliveryFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::UnknownMember => write!(f, "unknown-member"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A failed delivery to one target member
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub member: ClusterMember,
    pub kind: DeliveryFailureKind,
    pub reason: String,
}

impl DeliveryFailure {
    pub fn new<T: Into<String>>(member: ClusterMember, kind: DeliveryFailureKind, reason: T) -> Self {
        Self {
            member,
            kind,
            reason: reason.into(),
        }
    }
}

/// Aggregated outcome of a fan-out in which at least one delivery failed
#[derive(Debug, Clone)]
pub struct MessageFailure {
    pub message_id: Uuid,
    /// Members that acknowledged the message
    pub delivered: Vec<ClusterMember>,
    /// Responses of the acknowledging members whose handler set one
    pub responses: Vec<MemberResponse>,
    pub failures: Vec<DeliveryFailure>,
}

impl MessageFailure {
    /// Whether some targets received the message despite the failures
    pub fn is_partial(&self) -> bool {
        !self.delivered.is_empty()
    }

    pub fn failed_members(&self) -> Vec<&ClusterMember> {
        self.failures.iter().map(|f| &f.member).collect()
    }
}

impl fmt::Display for MessageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {} failed for {} of {} member(s)",
            self.message_id,
            self.failures.len(),
            self.failures.len() + self.delivered.len()
        )?;
        for failure in &self.failures {
            write!(
                f,
                "; {} [{}]: {}",
                failure.member.address, failure.kind, failure.reason
            )?;
        }
        Ok(())
    }
}
