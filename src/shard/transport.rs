//! Delivery of coordinator messages to shard participants

use super::message::{ShardMessage, ShardReply};
use super::participant::ShardParticipant;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::ShardId;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Message path from the coordinator to shard participants
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShardTransport: Send + Sync {
    /// Deliver one message and wait for the participant's reply
    async fn send(&self, msg: ShardMessage) -> CoordinatorResult<ShardReply>;
}

/// In-process transport routing to locally hosted participants
pub struct LocalTransport {
    participants: DashMap<ShardId, Arc<ShardParticipant>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            participants: DashMap::new(),
        }
    }

    /// Host a participant behind this transport
    pub fn attach(&self, participant: Arc<ShardParticipant>) {
        debug!("Attached participant for shard {}", participant.shard_id());
        self.participants.insert(participant.shard_id(), participant);
    }

    pub fn participant(&self, shard_id: ShardId) -> CoordinatorResult<Arc<ShardParticipant>> {
        self.participants
            .get(&shard_id)
            .map(|p| p.clone())
            .ok_or(CoordinatorError::ShardNotFound { shard_id })
    }

    pub fn participants(&self) -> Vec<Arc<ShardParticipant>> {
        self.participants.iter().map(|p| p.value().clone()).collect()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShardTransport for LocalTransport {
    async fn send(&self, msg: ShardMessage) -> CoordinatorResult<ShardReply> {
        let participant = self.participant(msg.shard_id)?;
        participant.handle(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::message::{MessagePhase, PrepareVote};
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_routes_by_shard_id() {
        let transport = LocalTransport::new();
        transport.attach(Arc::new(ShardParticipant::new(4, Duration::from_secs(5))));

        let msg = ShardMessage {
            transaction_id: Uuid::new_v4(),
            shard_id: 4,
            phase: MessagePhase::Prepare,
            resource_keys: vec!["k".to_string()],
            payload_hash: [0; 32],
        };
        let reply = transport.send(msg.clone()).await.unwrap();
        assert_eq!(reply, ShardReply::Vote(PrepareVote::Ok));
        assert_eq!(transport.participant(4).unwrap().lock_holder("k"), Some(msg.transaction_id));

        let missing = ShardMessage { shard_id: 5, ..msg };
        assert!(matches!(
            transport.send(missing).await,
            Err(CoordinatorError::ShardNotFound { shard_id: 5 })
        ));
    }
}
