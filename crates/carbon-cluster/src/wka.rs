//! Well-known-address membership scheme
//!
//! A joining node sends `Join` to the configured seeds and merges the member
//! lists they return; the seeds announce the newcomer to the rest of the
//! cluster. Liveness is tracked with TCP pings, and seeds that are not current
//! members are contacted again periodically so split groups of seeds merge.

use crate::config::parse_host_port;
use crate::error::{ClusterError, Result};
use crate::member::ClusterMember;
use crate::membership::MembershipManager;
use crate::protocol::Frame;
use crate::scheme::{SchemeCore, SchemeState};
use futures::future::join_all;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pause between join rounds while no seed is reachable
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub struct WkaMembershipScheme {
    core: SchemeCore,
}

impl WkaMembershipScheme {
    pub fn new(core: SchemeCore) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &SchemeCore {
        &self.core
    }

    pub async fn start(&mut self) -> Result<()> {
        self.core.set_state(SchemeState::Initializing);

        let entries = self.core.settings().wka.members.clone();
        let init_timeout = self.core.settings().timeouts.init();
        let manager = self.core.manager().clone();
        let local = manager.local_member().address;
        let deadline = Instant::now() + init_timeout;

        loop {
            let (local_is_seed, seeds) = remote_seeds(&entries, local).await;

            // A seed that accepts but never answers must not outlast the deadline
            let remaining = deadline.saturating_duration_since(Instant::now());
            let joined = match timeout(remaining, join(&manager, &seeds)).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::debug!("No well-known member answered before the init deadline");
                    0
                }
            };
            if joined > 0 {
                tracing::info!(
                    "Joined the cluster through {} well-known member(s)",
                    joined
                );
                break;
            }

            if local_is_seed {
                tracing::info!(
                    "No other well-known member is reachable, {} starts as the first member",
                    local
                );
                break;
            }

            if Instant::now() + JOIN_RETRY_INTERVAL > deadline {
                return Err(ClusterError::initialization(format!(
                    "Could not connect to any well-known member of [{}] within {:?}",
                    entries.join(", "),
                    init_timeout
                )));
            }

            tracing::warn!(
                "No well-known member is reachable, retrying in {:?}",
                JOIN_RETRY_INTERVAL
            );
            sleep(JOIN_RETRY_INTERVAL).await;
        }

        let cancel = self.core.cancellation_token();
        let timeouts = self.core.settings().timeouts.clone();
        let rejoin_period = self.core.settings().wka.rejoin_interval();

        self.core.spawn(ping_loop(
            manager.clone(),
            timeouts.heartbeat_interval(),
            timeouts.heartbeat_timeout(),
            cancel.clone(),
        ));
        self.core
            .spawn(rejoin_loop(manager, entries, rejoin_period, cancel));
        self.core.spawn_failure_sweeper();
        self.core.set_state(SchemeState::Active);

        tracing::info!(
            "WKA membership scheme active with {} member(s)",
            self.core.context().alive_member_count().await
        );
        Ok(())
    }

    pub async fn stop(&mut self) {
        let was_active = self.core.state() == SchemeState::Active;

        // Pings must not outlive the leave announcement
        self.core.shutdown_tasks().await;

        if was_active {
            let leave = Frame::Leave {
                sender: self.core.local_member().clone(),
            };
            let members = self.core.context().remote_members().await;
            let client = self.core.client();

            join_all(members.iter().map(|member| {
                let leave = &leave;
                async move {
                    if let Err(e) = client.notify(member.address, leave).await {
                        tracing::debug!("Could not send leave to {}: {}", member, e);
                    }
                }
            }))
            .await;
        }

        self.core.set_state(SchemeState::Stopped);
        tracing::info!("WKA membership scheme stopped");
    }
}

/// Resolve the configured seeds, excluding the local member.
///
/// Returns whether the local member is one of the seeds.
async fn remote_seeds(entries: &[String], local: SocketAddr) -> (bool, Vec<SocketAddr>) {
    let mut local_is_seed = false;
    let mut seeds = Vec::new();

    for addr in resolve_seeds(entries).await {
        if is_local_address(addr, local) {
            local_is_seed = true;
        } else {
            seeds.push(addr);
        }
    }
    (local_is_seed, seeds)
}

async fn resolve_seeds(entries: &[String]) -> Vec<SocketAddr> {
    let mut seeds: Vec<SocketAddr> = Vec::new();

    for entry in entries {
        let (host, port) = match parse_host_port(entry) {
            Ok(host_port) => host_port,
            Err(e) => {
                tracing::warn!("{}", e);
                continue;
            }
        };

        let resolved = lookup_host((host.as_str(), port)).await;
        match resolved {
            Ok(addrs) => {
                for addr in addrs {
                    if !seeds.contains(&addr) {
                        seeds.push(addr);
                    }
                }
            }
            Err(e) => tracing::debug!("Could not resolve well-known member {}: {}", entry, e),
        }
    }
    seeds
}

fn is_local_address(seed: SocketAddr, local: SocketAddr) -> bool {
    seed.port() == local.port()
        && (seed.ip() == local.ip() || seed.ip().is_loopback() || seed.ip().is_unspecified())
}

/// Send `Join` to every seed and merge the replies. Returns how many answered.
async fn join(manager: &Arc<MembershipManager>, seeds: &[SocketAddr]) -> usize {
    let request = Frame::Join {
        sender: manager.local_member().clone(),
    };

    let replies = join_all(seeds.iter().map(|seed| {
        let request = &request;
        async move { (*seed, manager.client().request(*seed, request).await) }
    }))
    .await;

    let mut answered = 0;
    for (seed, reply) in replies {
        match reply {
            Ok(frame @ Frame::MemberList { .. }) => {
                answered += 1;
                manager.handle(frame).await;
            }
            Ok(Frame::Nack { reason, .. }) => {
                tracing::warn!("Well-known member {} refused the join: {}", seed, reason);
            }
            Ok(other) => {
                tracing::debug!("Unexpected {} reply to join from {}", other.kind(), seed);
            }
            Err(e) => {
                tracing::debug!("Well-known member {} is not reachable: {}", seed, e);
            }
        }
    }
    answered
}

async fn ping_loop(
    manager: Arc<MembershipManager>,
    period: Duration,
    deadline: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let members = manager.context().remote_members().await;
                join_all(members.iter().map(|member| ping(&manager, member, deadline))).await;
            }
        }
    }
}

async fn ping(manager: &Arc<MembershipManager>, member: &ClusterMember, deadline: Duration) {
    let request = Frame::Ping {
        sender: manager.local_member().clone(),
    };

    match timeout(deadline, manager.client().request(member.address, &request)).await {
        Ok(Ok(Frame::Ack { sender, .. })) if sender.id == member.id => {
            if manager.context().contains(&member.id).await {
                manager.detector().heartbeat(member.id);
            }
        }
        Ok(Ok(Frame::Ack { sender, .. })) => {
            // Another process answers on this address now
            manager.member_seen(&sender).await;
        }
        Ok(Ok(other)) => {
            tracing::debug!("Unexpected {} reply to ping from {}", other.kind(), member);
        }
        Ok(Err(e)) => tracing::trace!("Ping to {} failed: {}", member, e),
        Err(_) => tracing::trace!("Ping to {} timed out", member),
    }
}

async fn rejoin_loop(
    manager: Arc<MembershipManager>,
    entries: Vec<String>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; the join round just ran
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let local = manager.local_member().address;
                let (_, seeds) = remote_seeds(&entries, local).await;

                let mut absent = Vec::new();
                for seed in seeds {
                    if manager.context().member_by_address(seed).await.is_none() {
                        absent.push(seed);
                    }
                }

                if !absent.is_empty() {
                    let joined = join(&manager, &absent).await;
                    if joined > 0 {
                        tracing::info!("Reconnected to {} well-known member(s)", joined);
                    }
                }
            }
        }
    }
}
