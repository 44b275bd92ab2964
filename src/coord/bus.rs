//! Broadcast hub connecting replicas, with bounded per-subscriber queues.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Event, ReplicaId, Seq0, Seq1, Stamp};

/// A leadership bid: HLC stamp first, random nibble as tiebreak, replica
/// id as the final total-order anchor. Lower wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Candidacy {
    pub stamp: Stamp,
    pub nibble: u8,
    pub replica: ReplicaId,
}

impl Candidacy {
    pub fn new(stamp: Stamp, nibble: u8, replica: ReplicaId) -> Self {
        Self {
            stamp,
            nibble: nibble & 0x0F,
            replica,
        }
    }
}

/// Everything replicas say to each other.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordMessage {
    Claim {
        candidacy: Candidacy,
    },
    Ack {
        claimant: ReplicaId,
    },
    Heartbeat {
        leader: ReplicaId,
        candidacy: Candidacy,
        watermark: Seq0,
    },
    HeartbeatResponse {
        follower: ReplicaId,
    },
    EventWatermark {
        seq: Seq0,
    },
    ReplayRequest {
        from: Seq1,
    },
    ReplayResponse {
        to: ReplicaId,
        events: Vec<Event>,
        /// The requested range fell behind retention; the follower must
        /// reset projections and restart from the leader's floor.
        compacted: bool,
        compacted_through: Seq0,
    },
    Logout,
}

/// A received message with its sender.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub from: ReplicaId,
    pub message: CoordMessage,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub lock poisoned")]
    LockPoisoned,
    #[error("replica {0} is not registered")]
    NotRegistered(ReplicaId),
}

/// In-process stand-in for the inter-replica broadcast channel.
///
/// Delivery is fan-out to every registered peer except the sender. A peer
/// whose queue is full is dropped rather than blocking the sender.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<Mutex<HubState>>,
    queue_capacity: usize,
}

struct HubState {
    peers: BTreeMap<ReplicaId, Sender<Envelope>>,
}

/// One replica's attachment to the hub.
pub struct HubEndpoint {
    pub replica: ReplicaId,
    receiver: Receiver<Envelope>,
    hub: BroadcastHub,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubState {
                peers: BTreeMap::new(),
            })),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn register(&self, replica: ReplicaId) -> Result<HubEndpoint, HubError> {
        let (tx, rx) = bounded(self.queue_capacity);
        let mut state = self.lock()?;
        state.peers.insert(replica, tx);
        Ok(HubEndpoint {
            replica,
            receiver: rx,
            hub: self.clone(),
        })
    }

    pub fn unregister(&self, replica: ReplicaId) -> Result<(), HubError> {
        let mut state = self.lock()?;
        state.peers.remove(&replica);
        Ok(())
    }

    /// Broadcast to every peer but the sender.
    pub fn broadcast(&self, from: ReplicaId, message: CoordMessage) -> Result<(), HubError> {
        let mut dropped = Vec::new();
        {
            let state = self.lock()?;
            for (peer, sender) in &state.peers {
                if *peer == from {
                    continue;
                }
                let envelope = Envelope {
                    from,
                    message: message.clone(),
                };
                match sender.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(peer = %peer, "peer queue full, dropping from hub");
                        dropped.push(*peer);
                    }
                    Err(TrySendError::Disconnected(_)) => dropped.push(*peer),
                }
            }
        }
        if !dropped.is_empty() {
            let mut state = self.lock()?;
            for peer in dropped {
                state.peers.remove(&peer);
            }
        }
        Ok(())
    }

    /// Targeted send, used for replay responses.
    pub fn send_to(
        &self,
        from: ReplicaId,
        to: ReplicaId,
        message: CoordMessage,
    ) -> Result<(), HubError> {
        let state = self.lock()?;
        let sender = state.peers.get(&to).ok_or(HubError::NotRegistered(to))?;
        let _ = sender.try_send(Envelope { from, message });
        Ok(())
    }

    pub fn peer_count(&self) -> Result<usize, HubError> {
        Ok(self.lock()?.peers.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HubState>, HubError> {
        self.inner.lock().map_err(|_| HubError::LockPoisoned)
    }
}

impl HubEndpoint {
    pub fn try_recv(&self) -> Option<Envelope> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<Envelope> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn broadcast(&self, message: CoordMessage) -> Result<(), HubError> {
        self.hub.broadcast(self.replica, message)
    }

    pub fn send_to(&self, to: ReplicaId, message: CoordMessage) -> Result<(), HubError> {
        self.hub.send_to(self.replica, to, message)
    }
}

impl Drop for HubEndpoint {
    fn drop(&mut self) {
        let _ = self.hub.unregister(self.replica);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn replica(b: u8) -> ReplicaId {
        ReplicaId::new(Uuid::from_bytes([b; 16]))
    }

    #[test]
    fn broadcast_excludes_sender() {
        let hub = BroadcastHub::new(16);
        let a = hub.register(replica(1)).unwrap();
        let b = hub.register(replica(2)).unwrap();

        a.broadcast(CoordMessage::Logout).unwrap();
        assert!(a.try_recv().is_none());
        let envelope = b.try_recv().unwrap();
        assert_eq!(envelope.from, replica(1));
        assert_eq!(envelope.message, CoordMessage::Logout);
    }

    #[test]
    fn send_to_targets_one_peer() {
        let hub = BroadcastHub::new(16);
        let a = hub.register(replica(1)).unwrap();
        let b = hub.register(replica(2)).unwrap();
        let c = hub.register(replica(3)).unwrap();

        a.send_to(replica(2), CoordMessage::Logout).unwrap();
        assert!(b.try_recv().is_some());
        assert!(c.try_recv().is_none());
    }

    #[test]
    fn unregister_on_drop() {
        let hub = BroadcastHub::new(16);
        let a = hub.register(replica(1)).unwrap();
        {
            let _b = hub.register(replica(2)).unwrap();
            assert_eq!(hub.peer_count().unwrap(), 2);
        }
        assert_eq!(hub.peer_count().unwrap(), 1);
        drop(a);
        assert_eq!(hub.peer_count().unwrap(), 0);
    }

    #[test]
    fn candidacy_orders_by_stamp_then_nibble() {
        let early = Candidacy::new(Stamp::new(100, 0), 9, replica(5));
        let late = Candidacy::new(Stamp::new(200, 0), 1, replica(1));
        assert!(early < late);

        let a = Candidacy::new(Stamp::new(100, 0), 2, replica(9));
        let b = Candidacy::new(Stamp::new(100, 0), 7, replica(1));
        assert!(a < b);
    }

    #[test]
    fn lagging_peer_is_dropped_not_blocking() {
        let hub = BroadcastHub::new(1);
        let a = hub.register(replica(1)).unwrap();
        let _b = hub.register(replica(2)).unwrap();

        a.broadcast(CoordMessage::Logout).unwrap();
        a.broadcast(CoordMessage::Logout).unwrap();
        assert_eq!(hub.peer_count().unwrap(), 1);
    }
}
