//! TCP transport between cluster members
//!
//! Each member runs one [`TcpReceiver`]; its address is the member's advertised
//! address. Peers talk to it through a [`PeerClient`] with one request and at
//! most one reply per exchange.

use crate::error::{ClusterError, Result};
use crate::membership::MembershipManager;
use crate::protocol::{codec, Frame};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Client side of the cluster transport
#[derive(Debug, Clone)]
pub struct PeerClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl PeerClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a frame and wait for the reply
    pub async fn request(&self, addr: SocketAddr, frame: &Frame) -> Result<Frame> {
        self.exchange(addr, frame.encode()?).await
    }

    /// Send an already encoded frame and wait for the reply
    pub async fn exchange(&self, addr: SocketAddr, data: Bytes) -> Result<Frame> {
        let mut framed = self.connect(addr).await?;

        timeout(self.request_timeout, roundtrip(&mut framed, data, addr))
            .await
            .map_err(|_| ClusterError::timeout(format!("No reply from {} in time", addr)))?
    }

    /// Send a frame that expects no reply
    pub async fn notify(&self, addr: SocketAddr, frame: &Frame) -> Result<()> {
        let data = frame.encode()?;
        let mut framed = self.connect(addr).await?;

        timeout(self.request_timeout, framed.send(data))
            .await
            .map_err(|_| ClusterError::timeout(format!("Sending to {} timed out", addr)))??;
        Ok(())
    }

    async fn connect(&self, addr: SocketAddr) -> Result<Framed<TcpStream, LengthDelimitedCodec>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClusterError::timeout(format!("Connection to {} timed out", addr)))?
            .map_err(|e| ClusterError::network(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Framed::new(stream, codec()))
    }
}

async fn roundtrip(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    data: Bytes,
    addr: SocketAddr,
) -> Result<Frame> {
    framed.send(data).await?;

    match framed.next().await {
        Some(Ok(reply)) => Frame::decode(&reply),
        Some(Err(e)) => Err(e.into()),
        None => Err(ClusterError::network(format!(
            "Connection to {} closed before a reply",
            addr
        ))),
    }
}

/// Accepting side of the cluster transport
#[derive(Debug)]
pub struct TcpReceiver {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpReceiver {
    /// Bind the preferred port, else the first free port of the range.
    ///
    /// A preferred port of `0` binds an ephemeral port.
    pub async fn bind(
        ip: IpAddr,
        preferred: Option<u16>,
        range_start: u16,
        range_size: u16,
    ) -> Result<Self> {
        if let Some(port) = preferred {
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => return Self::from_listener(listener),
                Err(e) if port == 0 => {
                    return Err(ClusterError::initialization(format!(
                        "Could not bind cluster receiver on {}: {}",
                        ip, e
                    )))
                }
                Err(e) => {
                    tracing::warn!(
                        "Preferred cluster port {}:{} is unavailable ({}), scanning {}-{}",
                        ip,
                        port,
                        e,
                        range_start,
                        range_start.saturating_add(range_size.saturating_sub(1))
                    );
                }
            }
        }

        let end = (u32::from(range_start) + u32::from(range_size)).min(u32::from(u16::MAX) + 1);
        for port in u32::from(range_start)..end {
            let port = port as u16;
            match TcpListener::bind((ip, port)).await {
                Ok(listener) => return Self::from_listener(listener),
                Err(e) => tracing::trace!("Port {}:{} unavailable: {}", ip, port, e),
            }
        }

        Err(ClusterError::initialization(format!(
            "No free port for the cluster receiver on {} in range {}-{}",
            ip,
            range_start,
            end.saturating_sub(1)
        )))
    }

    fn from_listener(listener: TcpListener) -> Result<Self> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ClusterError::initialization(format!("Receiver has no local address: {}", e)))?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until cancelled, answering frames through `manager`
    pub async fn serve(self, manager: Arc<MembershipManager>, cancel: CancellationToken) {
        tracing::info!("Cluster receiver listening on {}", self.local_addr);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let manager = manager.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager, cancel).await {
                                tracing::debug!("Connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept cluster connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        tracing::info!("Cluster receiver on {} stopped", self.local_addr);
    }
}

async fn handle_connection(
    stream: TcpStream,
    manager: Arc<MembershipManager>,
    cancel: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, codec());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = framed.next() => next,
        };
        let Some(data) = next else {
            break;
        };

        let frame = Frame::decode(&data?)?;
        tracing::trace!("Received {} frame from {}", frame.kind(), frame.sender().address);

        if let Some(reply) = manager.handle(frame).await {
            framed.send(reply.encode()?).await?;
        }
    }

    Ok(())
}
