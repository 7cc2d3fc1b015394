//! Single-task host for an [`OverlayNode`].
//!
//! All state lives on one task that drains a bounded mailbox. Timer tasks and
//! the transport pump only enqueue commands; API callers talk to the task
//! through an [`OverlayHandle`].

use crate::codec::OverlayCodec;
use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::events::OverlayEvent;
use crate::message::MessageId;
use crate::node::{OverlayNode, Outbox};
use crate::snapshot::TopologySnapshot;
use bytes::Bytes;
use cnp_core::NodeId;
use cnp_network::{Transport, TransportEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

enum Command {
    Initialize {
        reply: oneshot::Sender<Result<()>>,
    },
    Join {
        contact: SocketAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    CancelJoin {
        /// Whether the node attached before the cancellation was seen.
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        payload: Bytes,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    SendToRoot {
        payload: Bytes,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<Arc<TopologySnapshot>>>,
    },
    Transport(TransportEvent),
    RetryTick,
    ProbeTick,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable API to a running [`NodeActor`].
#[derive(Clone)]
pub struct OverlayHandle {
    me: NodeId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<OverlayEvent>,
}

impl OverlayHandle {
    #[inline]
    #[must_use]
    pub const fn me(&self) -> NodeId {
        self.me
    }

    /// Events emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| OverlayError::ActorStopped)?;
        rx.await.map_err(|_| OverlayError::ActorStopped)
    }

    /// Start a new overlay with this node as root leader.
    pub async fn initialize(&self) -> Result<()> {
        self.request(|reply| Command::Initialize { reply }).await?
    }

    /// Join through the node listening at `contact`, waiting at most
    /// `timeout` for a placement.
    pub async fn join(&self, contact: SocketAddr, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.request(|reply| Command::Join { contact, reply })).await {
            Ok(result) => result?,
            Err(_) => {
                // An acknowledgment may already be queued ahead of the cancel.
                if self.request(|reply| Command::CancelJoin { reply }).await? {
                    return Ok(());
                }
                tracing::warn!(
                    target: "canopy::actor",
                    contact = %contact,
                    timeout_ms = timeout.as_millis() as u64,
                    "Join timed out"
                );
                Err(OverlayError::JoinTimeout)
            },
        }
    }

    pub async fn broadcast(&self, payload: Bytes) -> Result<MessageId> {
        self.request(|reply| Command::Broadcast { payload, reply }).await?
    }

    pub async fn send_to_root(&self, payload: Bytes) -> Result<MessageId> {
        self.request(|reply| Command::SendToRoot { payload, reply }).await?
    }

    /// Current topology, or `None` before the node is placed.
    pub async fn snapshot(&self) -> Result<Option<Arc<TopologySnapshot>>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct NodeActor {
    node: OverlayNode,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    mailbox: mpsc::WeakSender<Command>,
    events: broadcast::Sender<OverlayEvent>,
    pending_join: Option<oneshot::Sender<Result<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeActor {
    /// Start the actor and its transport pump on the current runtime.
    pub fn spawn(
        me: NodeId,
        config: OverlayConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<OverlayHandle> {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity);
        let (events, _) = broadcast::channel(config.event_capacity);
        let node = OverlayNode::new(me, config)?;

        let mailbox = tx.downgrade();
        let pump = tokio::spawn(pump_transport(transport_events, mailbox.clone()));

        let actor = Self {
            node,
            transport,
            commands: rx,
            mailbox,
            events: events.clone(),
            pending_join: None,
            tasks: vec![pump],
        };
        tokio::spawn(actor.run());

        Ok(OverlayHandle {
            me,
            commands: tx,
            events,
        })
    }

    async fn run(mut self) {
        tracing::info!(target: "canopy::actor", node = %self.node.me(), "Overlay actor started");

        while let Some(command) = self.commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::info!(target: "canopy::actor", node = %self.node.me(), "Overlay actor stopped");
    }

    /// Returns false once the actor should stop.
    fn handle(&mut self, command: Command) -> bool {
        let now = now();
        match command {
            Command::Initialize { reply } => {
                let result = self.node.initialize().map(|out| self.dispatch(out));
                let _ = reply.send(result);
                self.start_timers();
            },
            Command::Join { contact, reply } => match self.node.join(contact) {
                Ok(out) => {
                    self.dispatch(out);
                    self.pending_join = Some(reply);
                },
                Err(e) => {
                    let _ = reply.send(Err(e));
                },
            },
            Command::CancelJoin { reply } => {
                self.node.cancel_join();
                self.pending_join = None;
                let _ = reply.send(self.node.is_attached());
            },
            Command::Broadcast { payload, reply } => {
                let result = self.node.broadcast(payload, now).map(|(id, out)| {
                    self.dispatch(out);
                    id
                });
                let _ = reply.send(result);
            },
            Command::SendToRoot { payload, reply } => {
                let result = self.node.send_to_root(payload, now).map(|(id, out)| {
                    self.dispatch(out);
                    id
                });
                let _ = reply.send(result);
            },
            Command::Snapshot { reply } => {
                let _ = reply.send(self.node.snapshot().cloned().map(Arc::new));
            },
            Command::Transport(TransportEvent::Frame(frame)) => {
                cnp_metrics::increment_frames_received();
                let out = match OverlayCodec::decode(&frame) {
                    Ok(envelope) => self.node.handle_envelope(envelope, now),
                    Err(e) => self.node.handle_malformed(&e.to_string()),
                };
                self.dispatch(out);
            },
            Command::Transport(TransportEvent::Unreachable(peer)) => {
                tracing::debug!(target: "canopy::actor", peer = %peer, "Transport reported peer unreachable");
                self.transport.forget(&peer);
                let out = self.node.handle_unreachable(peer, now);
                self.dispatch(out);
            },
            Command::RetryTick => {
                let out = self.node.on_retry_tick(now);
                self.dispatch(out);
            },
            Command::ProbeTick => {
                let out = self.node.on_probe_tick(now);
                self.dispatch(out);
            },
            Command::Shutdown { reply } => {
                tracing::info!(target: "canopy::actor", node = %self.node.me(), "Shutdown requested");
                let _ = reply.send(());
                return false;
            },
        }

        if self.pending_join.is_some() && self.node.is_attached() {
            if let Some(reply) = self.pending_join.take() {
                let _ = reply.send(Ok(()));
            }
            self.start_timers();
        }
        if self.node.is_disconnected() {
            self.stop_timers();
        }
        true
    }

    fn dispatch(&self, out: Outbox) {
        for envelope in out.messages {
            match OverlayCodec::encode(&envelope) {
                Ok(frame) => self.transport.send(&envelope.to, frame),
                Err(e) => {
                    tracing::error!(
                        target: "canopy::actor",
                        to = %envelope.to,
                        kind = envelope.body.name(),
                        error = %e,
                        "Failed to encode envelope"
                    );
                },
            }
        }
        for event in out.events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    fn start_timers(&mut self) {
        if !self.node.is_attached() || self.tasks.len() > 1 {
            return;
        }
        let config = self.node.config();
        self.tasks.push(tokio::spawn(tick(
            config.retry_tick,
            self.mailbox.clone(),
            || Command::RetryTick,
        )));
        self.tasks.push(tokio::spawn(tick(
            config.probe_interval,
            self.mailbox.clone(),
            || Command::ProbeTick,
        )));
    }

    fn stop_timers(&mut self) {
        // The pump at index 0 keeps running so queued frames drain.
        for task in self.tasks.drain(1..) {
            task.abort();
        }
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn tick(period: Duration, mailbox: mpsc::WeakSender<Command>, make: fn() -> Command) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(tx) = mailbox.upgrade() else {
            break;
        };
        match tx.try_send(make()) {
            Ok(()) | Err(TrySendError::Full(_)) => {},
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

async fn pump_transport(mut rx: mpsc::Receiver<TransportEvent>, mailbox: mpsc::WeakSender<Command>) {
    while let Some(event) = rx.recv().await {
        let Some(tx) = mailbox.upgrade() else {
            break;
        };
        match tx.try_send(Command::Transport(event)) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                tracing::warn!(target: "canopy::actor", "Mailbox full, dropping transport event");
            },
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cnp_network::MemoryNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn spawn_on(net: &MemoryNetwork, port: u16, config: OverlayConfig) -> OverlayHandle {
        let (transport, events) = net.register(addr(port), 256);
        NodeActor::spawn(NodeId::new(addr(port), 1), config, Arc::new(transport), events).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_before_and_after_initialize() {
        let net = MemoryNetwork::new();
        let handle = spawn_on(&net, 1, OverlayConfig::default());

        assert!(handle.snapshot().await.unwrap().is_none());
        handle.initialize().await.unwrap();
        let snap = handle.snapshot().await.unwrap().unwrap();
        assert!(snap.is_root() && snap.is_leader());

        handle.shutdown().await.unwrap();
        assert!(matches!(handle.broadcast(Bytes::new()).await, Err(OverlayError::ActorStopped)));
    }

    #[tokio::test]
    async fn test_join_without_contact_times_out() {
        let net = MemoryNetwork::new();
        let handle = spawn_on(&net, 2, OverlayConfig::default());

        let result = handle.join(addr(9), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(OverlayError::JoinTimeout)));
        assert!(matches!(handle.broadcast(Bytes::new()).await, Err(OverlayError::NotJoined)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_ack_queued_at_timeout_still_reports_attached() {
        let net = MemoryNetwork::new();
        let (contact, mut contact_rx) = net.register(addr(1), 16);
        let mut root = OverlayNode::new(NodeId::new(addr(1), 1), OverlayConfig::default()).unwrap();
        let _ = root.initialize().unwrap();

        let joiner = spawn_on(&net, 2, OverlayConfig::default());
        let join = tokio::spawn({
            let joiner = joiner.clone();
            async move { joiner.join(addr(1), Duration::from_millis(100)).await }
        });

        let Some(TransportEvent::Frame(frame)) = contact_rx.recv().await else {
            panic!("expected a join request");
        };
        let request = OverlayCodec::decode(&frame).unwrap();
        let out = root.handle_envelope(request, Instant::now());
        let ack = out
            .messages
            .into_iter()
            .find(|e| matches!(e.body, crate::message::Message::JoinAck { .. }))
            .unwrap();

        // The acknowledgment is in flight when the deadline passes.
        contact.send(&ack.to, OverlayCodec::encode(&ack).unwrap());
        tokio::time::advance(Duration::from_millis(100)).await;

        let result = join.await.unwrap();
        let attached = joiner.snapshot().await.unwrap().is_some();
        assert_eq!(result.is_ok(), attached, "join returned {result:?}");
    }
}
