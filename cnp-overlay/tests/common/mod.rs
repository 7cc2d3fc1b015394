//! Deterministic in-process network for driving [`OverlayNode`]s.
//!
//! Envelopes travel through the wire codec and a single FIFO queue. Sending
//! to a crashed or unknown node immediately reports the destination as
//! unreachable to the sender, like a refused connection would.

#![allow(dead_code, clippy::unwrap_used)]

use bytes::Bytes;
use cnp_core::NodeId;
use cnp_overlay::{
    Delivery, Envelope, MessageId, OverlayCodec, OverlayConfig, OverlayEvent, OverlayNode,
    Outbox, TopologySnapshot,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const STEP_LIMIT: usize = 100_000;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn node_id(port: u16) -> NodeId {
    NodeId::new(addr(port), u64::from(port))
}

pub struct SimNet {
    config: OverlayConfig,
    nodes: BTreeMap<u16, OverlayNode>,
    dead: BTreeSet<u16>,
    held: BTreeSet<u16>,
    muted: BTreeSet<u16>,
    queue: VecDeque<Envelope>,
    parked: Vec<Envelope>,
    events: BTreeMap<u16, Vec<OverlayEvent>>,
    now: Instant,
}

impl SimNet {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            nodes: BTreeMap::new(),
            dead: BTreeSet::new(),
            held: BTreeSet::new(),
            muted: BTreeSet::new(),
            queue: VecDeque::new(),
            parked: Vec::new(),
            events: BTreeMap::new(),
            now: Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn bootstrap(&mut self, port: u16) -> NodeId {
        let mut node = OverlayNode::new(node_id(port), self.config.clone()).unwrap();
        let out = node.initialize().unwrap();
        self.nodes.insert(port, node);
        self.absorb(port, out);
        node_id(port)
    }

    /// Start a join without delivering anything.
    pub fn start_join(&mut self, port: u16, contact: u16) -> NodeId {
        let mut node = OverlayNode::new(node_id(port), self.config.clone()).unwrap();
        let out = node.join(addr(contact)).unwrap();
        self.nodes.insert(port, node);
        self.absorb(port, out);
        node_id(port)
    }

    pub fn join(&mut self, port: u16, contact: u16) -> NodeId {
        let id = self.start_join(port, contact);
        self.run_until_quiet();
        assert!(self.node(port).is_attached(), "node {port} failed to join");
        id
    }

    pub fn node(&self, port: u16) -> &OverlayNode {
        &self.nodes[&port]
    }

    pub fn node_mut(&mut self, port: u16) -> &mut OverlayNode {
        self.nodes.get_mut(&port).unwrap()
    }

    pub fn snapshot(&self, port: u16) -> &TopologySnapshot {
        self.node(port).snapshot().unwrap()
    }

    pub fn live_ports(&self) -> Vec<u16> {
        self.nodes
            .keys()
            .copied()
            .filter(|p| !self.dead.contains(p) && !self.muted.contains(p))
            .collect()
    }

    pub fn absorb(&mut self, port: u16, out: Outbox) {
        self.queue.extend(out.messages);
        self.events.entry(port).or_default().extend(out.events);
    }

    pub fn broadcast(&mut self, port: u16, payload: &'static [u8]) -> MessageId {
        let now = self.now;
        let (id, out) = self
            .node_mut(port)
            .broadcast(Bytes::from_static(payload), now)
            .unwrap();
        self.absorb(port, out);
        id
    }

    pub fn send_to_root(&mut self, port: u16, payload: &'static [u8]) -> MessageId {
        let now = self.now;
        let (id, out) = self
            .node_mut(port)
            .send_to_root(Bytes::from_static(payload), now)
            .unwrap();
        self.absorb(port, out);
        id
    }

    /// Deliver the oldest queued envelope. Returns false when idle.
    pub fn step(&mut self) -> bool {
        let Some(envelope) = self.queue.pop_front() else {
            return false;
        };
        self.deliver(envelope);
        true
    }

    pub fn run_until_quiet(&mut self) {
        for _ in 0..STEP_LIMIT {
            if !self.step() {
                return;
            }
        }
        panic!("network did not quiesce");
    }

    fn deliver(&mut self, envelope: Envelope) {
        let from = envelope.from.addr().port();
        let to = envelope.to.addr().port();

        if self.dead.contains(&from) {
            return;
        }
        if self.dead.contains(&to) || !self.nodes.contains_key(&to) {
            let now = self.now;
            let out = self.node_mut(from).handle_unreachable(envelope.to, now);
            self.absorb(from, out);
            return;
        }
        if self.muted.contains(&to) {
            return;
        }
        if self.held.contains(&to) {
            self.parked.push(envelope);
            return;
        }

        let frame = OverlayCodec::encode(&envelope).unwrap();
        let decoded = OverlayCodec::decode(&frame).unwrap();
        let now = self.now;
        let out = self.node_mut(to).handle_envelope(decoded, now);
        self.absorb(to, out);
    }

    /// Park everything addressed to `port` until released.
    pub fn hold(&mut self, port: u16) {
        self.held.insert(port);
    }

    /// Deliver parked envelopes for `port` matching `pred` right away.
    pub fn release_where(&mut self, port: u16, pred: impl Fn(&Envelope) -> bool) {
        let (chosen, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|e| e.to.addr().port() == port && pred(e));
        self.parked = rest;
        let was_held = self.held.remove(&port);
        for envelope in chosen {
            self.deliver(envelope);
        }
        if was_held {
            self.held.insert(port);
        }
    }

    /// Stop holding `port` and queue its parked envelopes in arrival order.
    pub fn release(&mut self, port: u16) {
        self.held.remove(&port);
        let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|e| e.to.addr().port() == port);
        self.parked = rest;
        self.queue.extend(mine);
    }

    pub fn parked(&self) -> &[Envelope] {
        &self.parked
    }

    pub fn queued(&self) -> impl Iterator<Item = &Envelope> {
        self.queue.iter()
    }

    /// Remove queued envelopes matching `pred`, returning how many were lost.
    pub fn drop_where(&mut self, pred: impl Fn(&Envelope) -> bool) -> usize {
        let before = self.queue.len();
        self.queue.retain(|e| !pred(e));
        before - self.queue.len()
    }

    /// Hang `port`: it stays reachable but swallows everything and runs
    /// no timers.
    pub fn mute(&mut self, port: u16) {
        self.muted.insert(port);
    }

    /// Crash `port`: it stops sending and everything it had queued is lost.
    pub fn kill(&mut self, port: u16) {
        self.dead.insert(port);
        self.queue.retain(|e| e.from.addr().port() != port);
    }

    /// Advance time and fire every live node's retry timer.
    pub fn tick(&mut self, advance: Duration) {
        self.now += advance;
        let now = self.now;
        for port in self.live_ports() {
            let out = self.node_mut(port).on_retry_tick(now);
            self.absorb(port, out);
        }
    }

    /// One failure-detector round on every live node.
    pub fn probe(&mut self) {
        let now = self.now;
        for port in self.live_ports() {
            let out = self.node_mut(port).on_probe_tick(now);
            self.absorb(port, out);
        }
    }

    /// Run ticks until the network is quiet and nothing is pending anywhere.
    pub fn settle(&mut self) {
        for _ in 0..64 {
            self.run_until_quiet();
            if self.live_ports().iter().all(|p| self.node(*p).pending().is_empty()) {
                return;
            }
            self.tick(self.config.ack_timeout);
        }
        panic!("forwarding did not settle");
    }

    pub fn events(&self, port: u16) -> &[OverlayEvent] {
        self.events.get(&port).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn deliveries(&self, port: u16) -> Vec<&Delivery> {
        self.events(port)
            .iter()
            .filter_map(|e| match e {
                OverlayEvent::Delivered(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self, port: u16) -> usize {
        self.events(port)
            .iter()
            .filter(|e| matches!(e, OverlayEvent::Disconnected))
            .count()
    }
}
