//! Multicast membership scheme
//!
//! Every node sends a heartbeat datagram to the multicast group each
//! heartbeat interval and listens for the heartbeats of others. Discovery is
//! symmetric; silent members are dropped by the failure sweeper.

use crate::config::MulticastSettings;
use crate::error::{ClusterError, Result};
use crate::membership::MembershipManager;
use crate::protocol::{Frame, MAX_DATAGRAM};
use crate::scheme::{SchemeCore, SchemeState};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct MulticastMembershipScheme {
    core: SchemeCore,
    socket: Option<Arc<UdpSocket>>,
    group: Option<SocketAddr>,
}

impl MulticastMembershipScheme {
    pub fn new(core: SchemeCore) -> Self {
        Self {
            core,
            socket: None,
            group: None,
        }
    }

    pub fn core(&self) -> &SchemeCore {
        &self.core
    }

    pub async fn start(&mut self) -> Result<()> {
        self.core.set_state(SchemeState::Initializing);

        let settings = self.core.settings().multicast.clone();
        let group = SocketAddr::V4(SocketAddrV4::new(settings.group()?, settings.port));
        let socket = Arc::new(bind_multicast(&settings)?);

        let heartbeat = Frame::Heartbeat {
            sender: self.core.local_member().clone(),
        }
        .encode_datagram()
        .map_err(|e| ClusterError::initialization(format!("Cannot build heartbeat: {}", e)))?;

        let cancel = self.core.cancellation_token();
        let period = self.core.settings().timeouts.heartbeat_interval();

        self.core.spawn(receive_loop(
            socket.clone(),
            self.core.manager().clone(),
            cancel.clone(),
        ));
        self.core
            .spawn(heartbeat_loop(socket.clone(), group, heartbeat, period, cancel));
        self.core.spawn_failure_sweeper();

        self.socket = Some(socket);
        self.group = Some(group);
        self.core.set_state(SchemeState::Active);

        tracing::info!(
            "Multicast membership scheme active on group {} (domain {})",
            group,
            self.core.context().domain()
        );
        Ok(())
    }

    pub async fn stop(&mut self) {
        // No heartbeat may follow the leave datagram
        self.core.shutdown_tasks().await;

        if let (Some(socket), Some(group)) = (self.socket.take(), self.group.take()) {
            let leave = Frame::Leave {
                sender: self.core.local_member().clone(),
            };
            match leave.encode_datagram() {
                Ok(data) => {
                    if let Err(e) = socket.send_to(&data, group).await {
                        tracing::debug!("Failed to send leave datagram: {}", e);
                    }
                }
                Err(e) => tracing::debug!("Failed to encode leave datagram: {}", e),
            }
        }

        self.core.set_state(SchemeState::Stopped);
        tracing::info!("Multicast membership scheme stopped");
    }
}

/// Create a non-blocking UDP socket bound to the group port and joined to the group
fn bind_multicast(settings: &MulticastSettings) -> Result<UdpSocket> {
    let group = settings.group()?;
    let interface = settings.interface()?;
    let init_error = |what: &str, e: std::io::Error| {
        ClusterError::initialization(format!(
            "Could not {} multicast group {}:{}: {}",
            what, group, settings.port, e
        ))
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| init_error("create socket for", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| init_error("configure", e))?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket
        .set_reuse_port(true)
        .map_err(|e| init_error("configure", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| init_error("configure", e))?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.port));
    socket
        .bind(&bind_addr.into())
        .map_err(|e| init_error("bind", e))?;
    socket
        .join_multicast_v4(&group, &interface)
        .map_err(|e| init_error("join", e))?;
    socket
        .set_multicast_loop_v4(settings.loopback)
        .map_err(|e| init_error("configure", e))?;
    socket
        .set_multicast_ttl_v4(settings.ttl)
        .map_err(|e| init_error("configure", e))?;
    if !interface.is_unspecified() {
        socket
            .set_multicast_if_v4(&interface)
            .map_err(|e| init_error("configure", e))?;
    }

    UdpSocket::from_std(socket.into()).map_err(|e| init_error("register", e))
}

async fn heartbeat_loop(
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    heartbeat: Bytes,
    period: Duration,
    cancel: CancellationToken,
) {
    // The first tick fires immediately so peers learn about us right away
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&heartbeat, group).await {
                    tracing::warn!("Failed to send multicast heartbeat: {}", e);
                }
            }
        }
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    manager: Arc<MembershipManager>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("Multicast receive failed: {}", e);
                continue;
            }
        };

        match Frame::decode(&buf[..len]) {
            Ok(frame @ (Frame::Heartbeat { .. } | Frame::Leave { .. })) => {
                if frame.sender().id == manager.local_member().id {
                    continue;
                }
                tracing::trace!("Multicast {} from {}", frame.kind(), from);
                manager.handle(frame).await;
            }
            Ok(frame) => {
                tracing::debug!("Ignoring multicast {} frame from {}", frame.kind(), from);
            }
            Err(e) => {
                tracing::debug!("Ignoring malformed datagram from {}: {}", from, e);
            }
        }
    }
}
