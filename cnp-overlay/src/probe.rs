//! Missed-probe failure detector.
//!
//! Each probe round marks every target as owing a pong. A target that has
//! owed `threshold` pongs in a row at the start of a round is reported
//! unreachable and stops being tracked.

use cnp_core::NodeId;
use std::collections::{BTreeSet, HashMap};

pub struct ProbeTracker {
    threshold: u32,
    missed: HashMap<NodeId, u32>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub ping: Vec<NodeId>,
    pub expired: Vec<NodeId>,
}

impl ProbeTracker {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            missed: HashMap::new(),
        }
    }

    pub fn round(&mut self, targets: &BTreeSet<NodeId>) -> ProbeRound {
        self.missed.retain(|node, _| targets.contains(node));

        let mut round = ProbeRound::default();
        for target in targets {
            let missed = self.missed.entry(*target).or_insert(0);
            if *missed >= self.threshold {
                round.expired.push(*target);
            } else {
                *missed += 1;
                round.ping.push(*target);
            }
        }
        for node in &round.expired {
            self.missed.remove(node);
        }
        round
    }

    pub fn record_pong(&mut self, from: &NodeId) {
        if let Some(missed) = self.missed.get_mut(from) {
            *missed = 0;
        }
    }

    pub fn forget(&mut self, node: &NodeId) {
        self.missed.remove(node);
    }

    pub fn clear(&mut self) {
        self.missed.clear();
    }

    #[must_use]
    pub fn missed(&self, node: &NodeId) -> u32 {
        self.missed.get(node).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn node(port: u16) -> NodeId {
        NodeId::new(SocketAddr::from(([127, 0, 0, 1], port)), 1)
    }

    #[test]
    fn test_silent_peer_expires_after_threshold() {
        let mut tracker = ProbeTracker::new(2);
        let targets: BTreeSet<_> = [node(1), node(2)].into_iter().collect();

        assert_eq!(tracker.round(&targets).ping.len(), 2);
        tracker.record_pong(&node(1));
        assert_eq!(tracker.round(&targets).ping.len(), 2);
        tracker.record_pong(&node(1));

        let round = tracker.round(&targets);
        assert_eq!(round.expired, vec![node(2)]);
        assert_eq!(round.ping, vec![node(1)]);
        assert_eq!(tracker.missed(&node(2)), 0);
    }

    #[test]
    fn test_dropped_targets_are_forgotten() {
        let mut tracker = ProbeTracker::new(3);
        let targets: BTreeSet<_> = [node(1)].into_iter().collect();
        tracker.round(&targets);
        assert_eq!(tracker.missed(&node(1)), 1);

        tracker.round(&BTreeSet::new());
        assert_eq!(tracker.missed(&node(1)), 0);
    }
}
