//! Protocol events and the publish/subscribe bus
//!
//! Delivery is at-least-once: a subscriber may see an event again (for
//! example when a decision is re-driven after restart). Every event has a
//! stable key and `EventSubscription` drops keys it has already handed out,
//! so handlers stay idempotent. The remembered keys are bounded by the bus
//! capacity; the oldest are forgotten first.

use crate::coordination::Decision;
use crate::types::{channel_hex, ChannelId, ShardId, TransactionId};

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Events emitted by the coordinator and channel manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProtocolEvent {
    TransactionBegun {
        tx_id: TransactionId,
        shard_ids: Vec<ShardId>,
    },
    DecisionRecorded {
        tx_id: TransactionId,
        decision: Decision,
    },
    TransactionCompleted {
        tx_id: TransactionId,
        decision: Decision,
    },
    PartiallyApplied {
        tx_id: TransactionId,
        undelivered: Vec<ShardId>,
    },
    ChannelOpened {
        channel_id: ChannelId,
    },
    UpdateAccepted {
        channel_id: ChannelId,
        sequence: u64,
    },
    DisputeOpened {
        channel_id: ChannelId,
        sequence: u64,
    },
    ChallengeAccepted {
        channel_id: ChannelId,
        sequence: u64,
        window_restarted: bool,
    },
    ChannelClosed {
        channel_id: ChannelId,
        final_sequence: u64,
    },
}

impl ProtocolEvent {
    /// Get event name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::TransactionBegun { .. } => "transaction_begun",
            ProtocolEvent::DecisionRecorded { .. } => "decision_recorded",
            ProtocolEvent::TransactionCompleted { .. } => "transaction_completed",
            ProtocolEvent::PartiallyApplied { .. } => "partially_applied",
            ProtocolEvent::ChannelOpened { .. } => "channel_opened",
            ProtocolEvent::UpdateAccepted { .. } => "update_accepted",
            ProtocolEvent::DisputeOpened { .. } => "dispute_opened",
            ProtocolEvent::ChallengeAccepted { .. } => "challenge_accepted",
            ProtocolEvent::ChannelClosed { .. } => "channel_closed",
        }
    }

    /// Stable identity of the event, identical across redeliveries
    pub fn key(&self) -> String {
        match self {
            ProtocolEvent::TransactionBegun { tx_id, .. }
            | ProtocolEvent::DecisionRecorded { tx_id, .. }
            | ProtocolEvent::TransactionCompleted { tx_id, .. }
            | ProtocolEvent::PartiallyApplied { tx_id, .. } => {
                format!("{}:{}", self.name(), tx_id)
            }
            ProtocolEvent::ChannelOpened { channel_id }
            | ProtocolEvent::ChannelClosed { channel_id, .. } => {
                format!("{}:{}", self.name(), channel_hex(channel_id))
            }
            ProtocolEvent::UpdateAccepted {
                channel_id,
                sequence,
            }
            | ProtocolEvent::DisputeOpened {
                channel_id,
                sequence,
            }
            | ProtocolEvent::ChallengeAccepted {
                channel_id,
                sequence,
                ..
            } => format!("{}:{}:{}", self.name(), channel_hex(channel_id), sequence),
        }
    }
}

/// Broadcast bus for protocol events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProtocolEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ProtocolEvent) {
        debug!("Publishing event {}", event.key());
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            seen: SeenKeys::new(self.capacity),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Subscription that hands out each event key once
pub struct EventSubscription {
    rx: broadcast::Receiver<ProtocolEvent>,
    seen: SeenKeys,
}

/// Insertion-ordered key set that evicts its oldest key when full
struct SeenKeys {
    keys: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenKeys {
    fn new(capacity: usize) -> Self {
        Self {
            keys: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// `true` if the key was not already remembered
    fn insert(&mut self, key: String) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

impl EventSubscription {
    /// Next unseen event; `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<ProtocolEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.seen.insert(event.key()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next unseen event if one is already queued
    pub fn try_recv(&mut self) -> Option<ProtocolEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.seen.insert(event.key()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_duplicates_are_delivered_once() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();
        let tx_id = Uuid::new_v4();

        let event = ProtocolEvent::DecisionRecorded {
            tx_id,
            decision: Decision::Commit,
        };
        bus.publish(event.clone());
        bus.publish(event.clone());
        bus.publish(ProtocolEvent::TransactionCompleted {
            tx_id,
            decision: Decision::Commit,
        });

        assert_eq!(sub.recv().await, Some(event));
        assert_eq!(sub.recv().await.map(|e| e.name()), Some("transaction_completed"));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_remembered_keys_are_bounded() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        let first = ProtocolEvent::UpdateAccepted {
            channel_id: [2; 32],
            sequence: 0,
        };

        bus.publish(first.clone());
        assert_eq!(sub.recv().await, Some(first.clone()));
        for sequence in 1..=4 {
            bus.publish(ProtocolEvent::UpdateAccepted {
                channel_id: [2; 32],
                sequence,
            });
            assert!(sub.recv().await.is_some());
        }
        assert_eq!(sub.seen.len(), 4);

        // evicted, so a redelivery is handed out again
        bus.publish(first.clone());
        assert_eq!(sub.recv().await, Some(first));
        assert_eq!(sub.seen.len(), 4);
    }

    #[test]
    fn test_update_keys_include_sequence() {
        let a = ProtocolEvent::UpdateAccepted {
            channel_id: [1; 32],
            sequence: 1,
        };
        let b = ProtocolEvent::UpdateAccepted {
            channel_id: [1; 32],
            sequence: 2,
        };
        assert_ne!(a.key(), b.key());
    }
}
