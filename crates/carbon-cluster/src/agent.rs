//! Clustering agent
//!
//! The agent ties the pieces together: it binds the member's receiver,
//! registers the local member, starts the configured membership scheme and
//! exposes the application-facing messaging API. An external launcher calls
//! [`ClusteringAgent::init`] once and [`ClusteringAgent::shutdown`] when the
//! process stops.

use crate::config::LocalMemberSettings;
use crate::context::ClusterContext;
use crate::error::{ClusterError, Result};
use crate::group::{GroupManagementAgent, GroupRegistry};
use crate::member::ClusterMember;
use crate::membership::MembershipManager;
use crate::message::{
    ClusterMessage, LoggingMessageHandler, MessageHandler, ReceivedMessages, MAX_PURGE_PER_PASS,
    RECEIVED_CLEANUP_INTERVAL, RECEIVED_MESSAGE_LIFETIME,
};
use crate::messaging::{DeliveryReport, MessageReceiver, MessageSender};
use crate::scheme::{MembershipScheme, MembershipSchemeKind, SchemeCore};
use crate::transport::{PeerClient, TcpReceiver};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Initializing,
    Active,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Active,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Initializing => 1,
            Self::Active => 2,
        }
    }
}

/// Background tasks of the agent, cancelled and aborted when dropped
struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(task));
    }

    /// Cancel every task and wait for it to finish
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        for mut task in self.handles.drain(..) {
            if timeout(TASK_SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.handles {
            task.abort();
        }
    }
}

/// Resources owned by a running agent
struct AgentRuntime {
    context: Arc<ClusterContext>,
    scheme: MembershipScheme,
    tasks: BackgroundTasks,
}

/// Returns the agent to `Stopped` if `init` does not run to completion
struct InitGuard<'a> {
    agent: &'a ClusteringAgent,
    completed: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.agent.set_state(AgentState::Stopped);
        }
    }
}

/// Node-level entry point to the cluster
pub struct ClusteringAgent {
    handler: Arc<dyn MessageHandler>,
    received: Arc<ReceivedMessages>,
    groups: Arc<GroupRegistry>,
    init_called: AtomicBool,
    state: AtomicU8,
    context: OnceLock<Arc<ClusterContext>>,
    sender: OnceLock<MessageSender>,
    runtime: Mutex<Option<AgentRuntime>>,
}

impl ClusteringAgent {
    /// Create an agent whose received messages are only logged
    pub fn new() -> Self {
        Self::with_message_handler(Arc::new(LoggingMessageHandler))
    }

    /// Create an agent that executes received messages with `handler`
    pub fn with_message_handler(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler,
            received: Arc::new(ReceivedMessages::new()),
            groups: Arc::new(GroupRegistry::new()),
            init_called: AtomicBool::new(false),
            state: AtomicU8::new(AgentState::Stopped.as_u8()),
            context: OnceLock::new(),
            sender: OnceLock::new(),
            runtime: Mutex::new(None),
        }
    }

    /// Join the cluster described by the context's configuration.
    ///
    /// Blocks until the membership scheme is active or has failed. May only
    /// be called once per agent. Dropping the returned future before it
    /// completes stops every task it spawned and releases the receiver port.
    pub async fn init(&self, context: Arc<ClusterContext>) -> Result<()> {
        if self.init_called.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::invalid_state(
                "ClusteringAgent::init may only be called once",
            ));
        }

        tracing::info!("Initializing cluster...");
        self.set_state(AgentState::Initializing);
        let mut guard = InitGuard {
            agent: self,
            completed: false,
        };

        match self.start(context).await {
            Ok(runtime) => {
                *self.runtime.lock().await = Some(runtime);
                self.set_state(AgentState::Active);
                guard.completed = true;
                tracing::info!("Cluster initialization completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!("Cluster initialization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn start(&self, context: Arc<ClusterContext>) -> Result<AgentRuntime> {
        let settings = context.configuration().settings()?.clone();
        let kind: MembershipSchemeKind = settings.scheme_kind()?;

        if !context.configuration().should_initialize(kind.as_str())? {
            return Err(ClusterError::initialization(
                "Clustering is not enabled in the cluster configuration",
            ));
        }
        tracing::info!("Using {} based membership management scheme", kind);

        let host = advertised_host(&settings.local_member).await?;
        let bind_ip = match settings.local_member.bind_address.as_deref() {
            Some(bind_address) => resolve_ip(bind_address).await?,
            None => host,
        };

        let receiver = TcpReceiver::bind(
            bind_ip,
            settings.local_member.port,
            settings.local_member.port_range_start,
            settings.local_member.port_range_size,
        )
        .await?;
        let address = SocketAddr::new(host, receiver.local_addr().port());

        if host.is_loopback() {
            tracing::warn!(
                "Local member advertising its IP address as {}. \
                 Remote members will not be able to connect to this member.",
                host
            );
        }

        let local = ClusterMember::new(address, settings.domain.clone())
            .with_properties(settings.member_properties(&host.to_string()));
        context.register_local_member(local.clone()).await?;
        tracing::info!("Local member: {}", local);

        let client = PeerClient::new(settings.timeouts.connect(), settings.timeouts.send());
        let manager = Arc::new(MembershipManager::new(
            context.clone(),
            local.clone(),
            client.clone(),
            MessageReceiver::new(local.clone(), self.handler.clone(), self.received.clone()),
            settings.timeouts.heartbeat_timeout(),
        )
        .with_group_registry(self.groups.clone()));

        let mut tasks = BackgroundTasks::new();
        let cancel = tasks.token();
        tasks.spawn(receiver.serve(manager.clone(), cancel.clone()));
        tasks.spawn(cleanup_loop(self.received.clone(), cancel));

        let mut scheme = MembershipScheme::create(kind, SchemeCore::new(manager, settings.clone()));
        if let Err(e) = scheme.start().await {
            tasks.shutdown().await;
            context.clear().await;
            return Err(e);
        }

        // init runs once, so these are always empty here
        let _ = self.context.set(context.clone());
        let _ = self.sender.set(MessageSender::new(
            context.clone(),
            client,
            local,
            settings.max_retries,
            settings.timeouts.send(),
        ));

        Ok(AgentRuntime {
            context,
            scheme,
            tasks,
        })
    }

    /// Leave the cluster and release every network resource.
    ///
    /// Safe to call at any time, including before or after a failed `init`.
    pub async fn shutdown(&self) {
        let runtime = self.runtime.lock().await.take();
        self.set_state(AgentState::Stopped);

        let Some(mut runtime) = runtime else {
            tracing::debug!("Clustering agent is not running, nothing to shut down");
            return;
        };

        tracing::info!("Shutting down clustering agent");
        // Stop answering peers before announcing the departure
        runtime.tasks.shutdown().await;
        runtime.scheme.stop().await;
        runtime.context.clear().await;
        tracing::info!("Clustering agent stopped");
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: AgentState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn context(&self) -> Option<&Arc<ClusterContext>> {
        self.context.get()
    }

    pub fn local_member(&self) -> Option<ClusterMember> {
        self.context().and_then(|c| c.local_member().cloned())
    }

    /// Number of members in the primary member list, the local member included
    pub async fn get_alive_member_count(&self) -> usize {
        match self.context() {
            Some(context) => context.alive_member_count().await,
            None => 0,
        }
    }

    pub async fn get_members(&self) -> Vec<ClusterMember> {
        match self.context() {
            Some(context) => context.get_primary_cluster_members().await,
            None => Vec::new(),
        }
    }

    /// Configured well-known members when the WKA scheme is in use
    pub fn well_known_members(&self) -> Vec<String> {
        self.context()
            .and_then(|c| c.configuration().settings().ok())
            .filter(|s| matches!(s.scheme_kind(), Ok(MembershipSchemeKind::Wka)))
            .map(|s| s.wka.members.clone())
            .unwrap_or_default()
    }

    /// Whether this node is the oldest member of the cluster
    pub async fn is_coordinator(&self) -> bool {
        match self.context() {
            Some(context) => context.is_coordinator().await,
            None => false,
        }
    }

    /// A message this node received and executed
    pub fn received_message(&self, id: &Uuid) -> Option<ClusterMessage> {
        self.received.get(id)
    }

    /// Track the members of an application group alongside this cluster
    pub fn add_group_management_agent(&self, agent: Arc<GroupManagementAgent>) {
        self.groups.add(agent);
    }

    /// Agent of a managed group; `None` selects the default sub-domain
    pub fn get_group_management_agent(
        &self,
        domain: &str,
        sub_domain: Option<&str>,
    ) -> Option<Arc<GroupManagementAgent>> {
        self.groups.get(domain, sub_domain)
    }

    /// Forget the members of a managed group
    pub fn reset_group_management_agent(&self, domain: &str, sub_domain: Option<&str>) -> bool {
        self.groups.reset(domain, sub_domain)
    }

    /// Application domains with a group management agent
    pub fn get_domains(&self) -> Vec<String> {
        self.groups.domains()
    }

    /// Send a message to every other member of the cluster
    pub async fn send_message(&self, message: &ClusterMessage) -> Result<DeliveryReport> {
        self.active_sender()?.broadcast(message).await
    }

    /// Send a message to the given members only
    pub async fn send_message_to(
        &self,
        message: &ClusterMessage,
        members: &[ClusterMember],
    ) -> Result<DeliveryReport> {
        self.active_sender()?.send_to(message, members).await
    }

    fn active_sender(&self) -> Result<&MessageSender> {
        if self.state() != AgentState::Active {
            return Err(ClusterError::NotInitialized);
        }
        self.sender.get().ok_or(ClusterError::NotInitialized)
    }
}

impl Default for ClusteringAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClusteringAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusteringAgent")
            .field("state", &self.state())
            .field("local_member", &self.local_member())
            .finish_non_exhaustive()
    }
}

async fn advertised_host(settings: &LocalMemberSettings) -> Result<IpAddr> {
    match settings.host.as_deref() {
        Some(host) => resolve_ip(host).await,
        None => Ok(local_ip_address::local_ip().unwrap_or_else(|e| {
            tracing::warn!("Could not detect the local IP address ({}), using 127.0.0.1", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        })),
    }
}

async fn resolve_ip(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.trim().parse::<IpAddr>() {
        return Ok(ip);
    }

    lookup_host((host.trim(), 0))
        .await
        .map_err(|e| ClusterError::initialization(format!("Could not resolve host {}: {}", host, e)))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ClusterError::initialization(format!("Host {} has no address", host)))
}

/// Periodically forget old received messages
async fn cleanup_loop(received: Arc<ReceivedMessages>, cancel: CancellationToken) {
    let mut ticker = interval(RECEIVED_CLEANUP_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let purged = received.purge_expired(RECEIVED_MESSAGE_LIFETIME, MAX_PURGE_PER_PASS);
                if purged > 0 {
                    tracing::debug!("Purged {} received message(s)", purged);
                }
            }
        }
    }
}
