//! Membership scheme selection and shared scheme machinery

use crate::config::ClusterSettings;
use crate::context::ClusterContext;
use crate::error::{ClusterError, Result};
use crate::member::ClusterMember;
use crate::membership::MembershipManager;
use crate::multicast::MulticastMembershipScheme;
use crate::transport::PeerClient;
use crate::wka::WkaMembershipScheme;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How long a stopping scheme waits for each background task
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Supported peer-discovery strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipSchemeKind {
    Multicast,
    Wka,
}

impl MembershipSchemeKind {
    pub const SUPPORTED: [MembershipSchemeKind; 2] = [Self::Multicast, Self::Wka];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Multicast => "multicast",
            Self::Wka => "wka",
        }
    }
}

impl fmt::Display for MembershipSchemeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipSchemeKind {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Self::SUPPORTED
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::SUPPORTED.iter().map(|k| k.as_str()).collect();
                ClusterError::configuration(format!(
                    "Invalid membership scheme '{}'. Supported schemes are {}",
                    name,
                    supported.join(", ")
                ))
            })
    }
}

/// Lifecycle state of a membership scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemeState {
    Stopped,
    Initializing,
    Active,
}

/// Resources shared by every scheme: the membership manager, settings and
/// the background tasks the scheme spawned
pub struct SchemeCore {
    manager: Arc<MembershipManager>,
    settings: ClusterSettings,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    state: SchemeState,
}

impl SchemeCore {
    pub fn new(manager: Arc<MembershipManager>, settings: ClusterSettings) -> Self {
        Self {
            manager,
            settings,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            state: SchemeState::Stopped,
        }
    }

    pub fn manager(&self) -> &Arc<MembershipManager> {
        &self.manager
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        self.manager.context()
    }

    pub fn client(&self) -> &PeerClient {
        self.manager.client()
    }

    pub fn local_member(&self) -> &ClusterMember {
        self.manager.local_member()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SchemeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SchemeState) {
        tracing::debug!("Membership scheme state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Spawn a background task owned by the scheme
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    /// Periodically drop members whose heartbeats timed out
    pub fn spawn_failure_sweeper(&mut self) {
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        let period = self.settings.timeouts.heartbeat_interval();

        self.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
        });
    }

    /// Cancel and reap every background task
    pub async fn shutdown_tasks(&mut self) {
        self.cancel.cancel();

        for mut task in self.tasks.drain(..) {
            if timeout(TASK_SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Membership task did not stop in time, aborting it");
                task.abort();
            }
        }
        self.manager.forget_all();
    }
}

impl Drop for SchemeCore {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Membership scheme chosen by configuration
pub enum MembershipScheme {
    Multicast(MulticastMembershipScheme),
    Wka(WkaMembershipScheme),
}

impl MembershipScheme {
    pub fn create(kind: MembershipSchemeKind, core: SchemeCore) -> Self {
        match kind {
            MembershipSchemeKind::Multicast => Self::Multicast(MulticastMembershipScheme::new(core)),
            MembershipSchemeKind::Wka => Self::Wka(WkaMembershipScheme::new(core)),
        }
    }

    pub fn kind(&self) -> MembershipSchemeKind {
        match self {
            Self::Multicast(_) => MembershipSchemeKind::Multicast,
            Self::Wka(_) => MembershipSchemeKind::Wka,
        }
    }

    /// Start discovery. Returns once the scheme is active.
    pub async fn start(&mut self) -> Result<()> {
        let result = match self {
            Self::Multicast(scheme) => scheme.start().await,
            Self::Wka(scheme) => scheme.start().await,
        };

        if result.is_err() {
            self.stop().await;
        }
        result
    }

    /// Announce departure and stop all scheme tasks
    pub async fn stop(&mut self) {
        match self {
            Self::Multicast(scheme) => scheme.stop().await,
            Self::Wka(scheme) => scheme.stop().await,
        }
    }

    pub fn state(&self) -> SchemeState {
        self.core().state()
    }

    fn core(&self) -> &SchemeCore {
        match self {
            Self::Multicast(scheme) => scheme.core(),
            Self::Wka(scheme) => scheme.core(),
        }
    }
}

impl fmt::Debug for MembershipScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipScheme")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}
