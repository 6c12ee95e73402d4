//! Cluster message delivery
//!
//! Sending is a best-effort fan-out: every target is attempted concurrently
//! and independently, and one failing target never stops delivery to the
//! others. When any target fails the call returns
//! [`ClusterError::MessageFailed`] carrying both the members that acknowledged
//! the message and the per-member failures.
//!
//! Every acknowledgement may carry the response the remote handler set, so a
//! send doubles as a request to all targets; responses are collected per
//! member.
//!
//! Receiving executes each message id at most once through the registered
//! [`MessageHandler`] and records the execution marker. A duplicate is only
//! acknowledged once the first execution succeeded.

use crate::context::ClusterContext;
use crate::error::{
    ClusterError, DeliveryFailure, DeliveryFailureKind, MessageFailure, Result,
};
use crate::member::{ClusterMember, MemberId};
use crate::message::{
    ClusterMessage, ExecutionOutcome, MemberResponse, MessageHandler, ReceivedMessages,
    Reservation, EXECUTED,
};
use crate::protocol::Frame;
use crate::transport::PeerClient;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Backoff step between delivery attempts; attempt `n` waits `n` steps
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Outcome of a fully successful send
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub message_id: Uuid,
    /// Members that acknowledged the message
    pub delivered: Vec<ClusterMember>,
    /// Responses returned by the members whose handler set one
    pub responses: Vec<MemberResponse>,
}

impl DeliveryReport {
    /// Response returned by the given member, if any
    pub fn response_from(&self, id: &MemberId) -> Option<&serde_json::Value> {
        self.responses
            .iter()
            .find(|r| &r.member.id == id)
            .map(|r| &r.payload)
    }
}

/// Sending side of the messaging layer
#[derive(Clone)]
pub struct MessageSender {
    context: Arc<ClusterContext>,
    client: PeerClient,
    local: ClusterMember,
    max_retries: u32,
    send_timeout: Duration,
}

impl MessageSender {
    pub fn new(
        context: Arc<ClusterContext>,
        client: PeerClient,
        local: ClusterMember,
        max_retries: u32,
        send_timeout: Duration,
    ) -> Self {
        Self {
            context,
            client,
            local,
            max_retries,
            send_timeout,
        }
    }

    /// Send to every remote member currently in the primary member list
    pub async fn broadcast(&self, message: &ClusterMessage) -> Result<DeliveryReport> {
        let targets = self.context.remote_members().await;
        tracing::debug!(
            "Broadcasting message {} to {} member(s)",
            message.id,
            targets.len()
        );
        self.fan_out(message, targets, Vec::new()).await
    }

    /// Send to a subset of members.
    ///
    /// Members that are not current cluster members fail without any network
    /// I/O. Repeated members are sent to once.
    pub async fn send_to(
        &self,
        message: &ClusterMessage,
        members: &[ClusterMember],
    ) -> Result<DeliveryReport> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        let mut failures = Vec::new();

        for member in members {
            if !seen.insert(member.clone()) {
                continue;
            }

            if member.id == self.local.id {
                failures.push(DeliveryFailure::new(
                    member.clone(),
                    DeliveryFailureKind::Local,
                    "the local member is not a message target",
                ));
                continue;
            }

            match self.context.get_member(&member.id).await {
                Some(current) if current.address == member.address => targets.push(current),
                _ => failures.push(DeliveryFailure::new(
                    member.clone(),
                    DeliveryFailureKind::UnknownMember,
                    "not a current cluster member",
                )),
            }
        }

        self.fan_out(message, targets, failures).await
    }

    async fn fan_out(
        &self,
        message: &ClusterMessage,
        targets: Vec<ClusterMember>,
        mut failures: Vec<DeliveryFailure>,
    ) -> Result<DeliveryReport> {
        let frame = Frame::Application {
            sender: self.local.clone(),
            message: message.clone(),
        };
        let mut delivered = Vec::new();
        let mut responses = Vec::new();

        match frame.encode() {
            Ok(data) => {
                let outcomes = join_all(targets.into_iter().map(|target| {
                    let data = data.clone();
                    async move {
                        let outcome = self.deliver(&target, data).await;
                        (target, outcome)
                    }
                }))
                .await;

                for (target, outcome) in outcomes {
                    match outcome {
                        Ok(response) => {
                            if let Some(payload) = response {
                                responses.push(MemberResponse {
                                    member: target.clone(),
                                    payload,
                                });
                            }
                            delivered.push(target);
                        }
                        Err(failure) => failures.push(failure),
                    }
                }
            }
            Err(e) => {
                failures.extend(targets.into_iter().map(|target| {
                    DeliveryFailure::new(
                        target,
                        DeliveryFailureKind::Local,
                        format!("Could not serialize message: {}", e),
                    )
                }));
            }
        }

        if failures.is_empty() {
            tracing::debug!(
                "Message {} delivered to {} member(s)",
                message.id,
                delivered.len()
            );
            return Ok(DeliveryReport {
                message_id: message.id,
                delivered,
                responses,
            });
        }

        let failure = MessageFailure {
            message_id: message.id,
            delivered,
            responses,
            failures,
        };
        tracing::warn!("{}", failure);
        Err(ClusterError::message_failed(failure))
    }

    async fn deliver(
        &self,
        target: &ClusterMember,
        data: Bytes,
    ) -> std::result::Result<Option<serde_json::Value>, DeliveryFailure> {
        let attempts = async {
            let mut attempt = 0u32;
            loop {
                match self.client.exchange(target.address, data.clone()).await {
                    Ok(Frame::Ack { response, .. }) => return Ok(response),
                    Ok(Frame::Nack { reason, .. }) => {
                        return Err((DeliveryFailureKind::Rejected, reason))
                    }
                    Ok(other) => {
                        return Err((
                            DeliveryFailureKind::Rejected,
                            format!("unexpected {} reply", other.kind()),
                        ))
                    }
                    Err(e) if attempt >= self.max_retries => {
                        return Err((DeliveryFailureKind::Unreachable, e.to_string()))
                    }
                    Err(e) => {
                        attempt += 1;
                        tracing::trace!(
                            "Delivery to {} failed ({}), retry {}/{}",
                            target.address,
                            e,
                            attempt,
                            self.max_retries
                        );
                        sleep(RETRY_BACKOFF * attempt).await;
                    }
                }
            }
        };

        match timeout(self.send_timeout, attempts).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err((kind, reason))) => Err(DeliveryFailure::new(target.clone(), kind, reason)),
            Err(_) => Err(DeliveryFailure::new(
                target.clone(),
                DeliveryFailureKind::Timeout,
                format!("no acknowledgement within {:?}", self.send_timeout),
            )),
        }
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("local", &self.local.address)
            .field("max_retries", &self.max_retries)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

/// Receiving side of the messaging layer
pub struct MessageReceiver {
    local: ClusterMember,
    handler: Arc<dyn MessageHandler>,
    received: Arc<ReceivedMessages>,
}

impl MessageReceiver {
    pub fn new(
        local: ClusterMember,
        handler: Arc<dyn MessageHandler>,
        received: Arc<ReceivedMessages>,
    ) -> Self {
        Self {
            local,
            handler,
            received,
        }
    }

    pub fn received(&self) -> &Arc<ReceivedMessages> {
        &self.received
    }

    /// Execute a received message and build the reply.
    ///
    /// A message id that was already received is not executed again; the
    /// duplicate gets the reply of the first execution once it settles.
    pub async fn receive(&self, sender: &ClusterMember, mut message: ClusterMessage) -> Frame {
        let id = message.id;

        if let Reservation::Duplicate(outcome) = self.received.reserve(id) {
            tracing::debug!("Message {} from {} already received", id, sender.address);
            return self.settled(id, outcome).await;
        }
        let mut pending = PendingExecution {
            received: &self.received,
            id,
            settled: false,
        };

        let executed = self.handler.execute(&mut message, sender).await;
        pending.settled = true;

        match executed {
            Ok(()) => {
                if !message.is_executed() {
                    message.mark_executed(EXECUTED);
                }
                tracing::debug!("Executed message {} from {}", id, sender.address);
                let response = message.response().cloned();
                self.received.complete(message);
                self.ack(id, response)
            }
            Err(e) => {
                let reason = e.to_string();
                self.received.release(&id, &reason);
                tracing::warn!(
                    "Failed to execute message {} from {}: {}",
                    id,
                    sender.address,
                    reason
                );
                self.nack(id, reason)
            }
        }
    }

    /// Wait for the first execution of a duplicate and reply with its outcome
    async fn settled(
        &self,
        id: Uuid,
        mut outcome: watch::Receiver<Option<ExecutionOutcome>>,
    ) -> Frame {
        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone(),
            Err(_) => None,
        };

        match settled {
            Some(ExecutionOutcome::Executed(response)) => self.ack(id, response),
            Some(ExecutionOutcome::Failed(reason)) => self.nack(id, reason),
            None => self.nack(id, "message was dropped before it executed".to_string()),
        }
    }

    fn ack(&self, id: Uuid, response: Option<serde_json::Value>) -> Frame {
        Frame::Ack {
            sender: self.local.clone(),
            message_id: Some(id),
            response,
        }
    }

    fn nack(&self, id: Uuid, reason: String) -> Frame {
        Frame::Nack {
            sender: self.local.clone(),
            message_id: Some(id),
            reason,
        }
    }
}

/// Frees the reservation of an execution dropped before it finished
struct PendingExecution<'a> {
    received: &'a ReceivedMessages,
    id: Uuid,
    settled: bool,
}

impl Drop for PendingExecution<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.received
                .release(&self.id, "execution was abandoned before it finished");
        }
    }
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("local", &self.local.address)
            .field("received", &self.received.len())
            .finish()
    }
}
