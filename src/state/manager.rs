//! SQLite state manager
//!
//! Durable decision log for the coordinator and the write-once ledger
//! anchor tables for outcomes, settlements and confirmed deposits.

use crate::anchor::{ChannelSettlementRecord, LedgerAnchor, TransactionOutcomeRecord};
use crate::config::DatabaseConfig;
use crate::coordination::{Decision, DecisionLog, DecisionRecord, DeliveryStatus};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::types::{channel_hex, ChannelId, ShardId, TransactionId};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// State manager for SQLite persistence
pub struct StateManager {
    pool: SqlitePool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database, migrated and ready for use
    pub async fn in_memory() -> CoordinatorResult<Self> {
        // A memory database lives as long as its single connection
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let manager = Self { pool };
        manager.run_migrations().await?;
        Ok(manager)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                tx_id TEXT PRIMARY KEY,
                decision TEXT NOT NULL,
                shards TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                anchored INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decision_deliveries (
                tx_id TEXT NOT NULL,
                shard_id INTEGER NOT NULL,
                delivered_at INTEGER NOT NULL,
                PRIMARY KEY (tx_id, shard_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_decisions_status
            ON decisions (status, anchored)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_outcomes (
                tx_id TEXT PRIMARY KEY,
                decision TEXT NOT NULL,
                shard_ids TEXT NOT NULL,
                anchored_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_settlements (
                channel_id TEXT PRIMARY KEY,
                final_sequence INTEGER NOT NULL,
                final_state_hash TEXT NOT NULL,
                closed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channel_deposits (
                channel_id TEXT NOT NULL,
                participant TEXT NOT NULL,
                amount TEXT NOT NULL,
                confirmed_at INTEGER NOT NULL,
                PRIMARY KEY (channel_id, participant)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Record a deposit confirmed on the settlement layer
    pub async fn record_deposit(
        &self,
        channel_id: &ChannelId,
        participant: &str,
        amount: u128,
    ) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_deposits (channel_id, participant, amount, confirmed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (channel_id, participant)
            DO UPDATE SET amount = excluded.amount, confirmed_at = excluded.confirmed_at
            "#,
        )
        .bind(channel_hex(channel_id))
        .bind(participant)
        .bind(amount.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        debug!(
            "Deposit confirmed for {} on channel {}",
            participant,
            channel_hex(channel_id)
        );
        Ok(())
    }

    /// Get decision statistics
    pub async fn get_stats(&self) -> CoordinatorResult<DecisionStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN decision = 'commit' THEN 1 ELSE 0 END), 0) AS committed,
                COALESCE(SUM(CASE WHEN decision = 'abort' THEN 1 ELSE 0 END), 0) AS aborted,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'partially_applied' THEN 1 ELSE 0 END), 0) AS partially_applied
            FROM decisions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let settled: i64 = sqlx::query("SELECT COUNT(*) AS settled FROM channel_settlements")
            .fetch_one(&self.pool)
            .await?
            .get("settled");

        Ok(DecisionStats {
            total: row.get::<i64, _>("total") as u64,
            committed: row.get::<i64, _>("committed") as u64,
            aborted: row.get::<i64, _>("aborted") as u64,
            pending: row.get::<i64, _>("pending") as u64,
            partially_applied: row.get::<i64, _>("partially_applied") as u64,
            channels_settled: settled as u64,
        })
    }

    async fn delivered_shards(&self, tx_id: &str) -> CoordinatorResult<BTreeSet<ShardId>> {
        let rows = sqlx::query("SELECT shard_id FROM decision_deliveries WHERE tx_id = ?")
            .bind(tx_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| {
                let raw: i64 = r.get("shard_id");
                ShardId::try_from(raw)
                    .map_err(|_| CoordinatorError::Internal(format!("bad stored shard id {}", raw)))
            })
            .collect()
    }

    async fn row_to_decision(&self, row: sqlx::sqlite::SqliteRow) -> CoordinatorResult<DecisionRecord> {
        let tx_id_str: String = row.get("tx_id");
        let transaction_id = Uuid::parse_str(&tx_id_str)
            .map_err(|e| CoordinatorError::Internal(format!("bad tx id {}: {}", tx_id_str, e)))?;

        let decision_str: String = row.get("decision");
        let decision = Decision::parse(&decision_str)
            .ok_or_else(|| CoordinatorError::Internal(format!("bad decision {}", decision_str)))?;

        let status_str: String = row.get("status");
        let status = DeliveryStatus::parse(&status_str)
            .ok_or_else(|| CoordinatorError::Internal(format!("bad status {}", status_str)))?;

        let shards_json: String = row.get("shards");
        let shards: BTreeMap<ShardId, Vec<String>> = serde_json::from_str(&shards_json)?;

        let hash_hex: String = row.get("payload_hash");
        let mut payload_hash = [0u8; 32];
        hex::decode_to_slice(&hash_hex, &mut payload_hash)
            .map_err(|e| CoordinatorError::Internal(format!("bad payload hash: {}", e)))?;

        let delivered = self.delivered_shards(&tx_id_str).await?;

        Ok(DecisionRecord {
            transaction_id,
            decision,
            shards,
            payload_hash,
            delivered,
            status,
            anchored: row.get::<i64, _>("anchored") != 0,
        })
    }
}

#[async_trait]
impl DecisionLog for StateManager {
    async fn record_decision(&self, record: &DecisionRecord) -> CoordinatorResult<()> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO decisions
                (tx_id, decision, shards, payload_hash, status, anchored, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (tx_id) DO NOTHING
            "#,
        )
        .bind(record.transaction_id.to_string())
        .bind(record.decision.as_str())
        .bind(serde_json::to_string(&record.shards)?)
        .bind(hex::encode(record.payload_hash))
        .bind(record.status.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.get_decision(record.transaction_id).await?;
            if existing.map(|e| e.decision) != Some(record.decision) {
                return Err(CoordinatorError::Internal(format!(
                    "conflicting decision for {}",
                    record.transaction_id
                )));
            }
        }

        debug!(
            "Decision {} recorded for {}",
            record.decision.as_str(),
            record.transaction_id
        );
        Ok(())
    }

    async fn mark_delivered(&self, tx_id: TransactionId, shard_id: ShardId) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO decision_deliveries (tx_id, shard_id, delivered_at)
            VALUES (?, ?, ?)
            ON CONFLICT (tx_id, shard_id) DO NOTHING
            "#,
        )
        .bind(tx_id.to_string())
        .bind(sql_int(shard_id, "shard id")?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_anchored(&self, tx_id: TransactionId) -> CoordinatorResult<()> {
        sqlx::query("UPDATE decisions SET anchored = 1, updated_at = ? WHERE tx_id = ?")
            .bind(Utc::now().timestamp())
            .bind(tx_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_status(&self, tx_id: TransactionId, status: DeliveryStatus) -> CoordinatorResult<()> {
        sqlx::query("UPDATE decisions SET status = ?, updated_at = ? WHERE tx_id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(tx_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn pending_decisions(&self) -> CoordinatorResult<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT tx_id, decision, shards, payload_hash, status, anchored
            FROM decisions
            WHERE status = 'pending' OR anchored = 0
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.row_to_decision(row).await?);
        }
        Ok(records)
    }

    async fn get_decision(&self, tx_id: TransactionId) -> CoordinatorResult<Option<DecisionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT tx_id, decision, shards, payload_hash, status, anchored
            FROM decisions
            WHERE tx_id = ?
            "#,
        )
        .bind(tx_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_decision(row).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LedgerAnchor for StateManager {
    async fn record_transaction_outcome(
        &self,
        record: &TransactionOutcomeRecord,
    ) -> CoordinatorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO transaction_outcomes (tx_id, decision, shard_ids, anchored_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (tx_id) DO NOTHING
            "#,
        )
        .bind(record.transaction_id.to_string())
        .bind(record.decision.as_str())
        .bind(serde_json::to_string(&record.shard_ids)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::AlreadyAnchored {
                key: record.transaction_id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_channel_settlement(
        &self,
        record: &ChannelSettlementRecord,
    ) -> CoordinatorResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO channel_settlements (channel_id, final_sequence, final_state_hash, closed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (channel_id) DO NOTHING
            "#,
        )
        .bind(channel_hex(&record.channel_id))
        .bind(sql_int(record.final_sequence, "final sequence")?)
        .bind(hex::encode(record.final_state_hash))
        .bind(record.closed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoordinatorError::AlreadyAnchored {
                key: channel_hex(&record.channel_id),
            });
        }
        Ok(())
    }

    async fn confirmed_deposit(
        &self,
        channel_id: &ChannelId,
        participant: &str,
    ) -> CoordinatorResult<Option<u128>> {
        let row = sqlx::query(
            "SELECT amount FROM channel_deposits WHERE channel_id = ? AND participant = ?",
        )
        .bind(channel_hex(channel_id))
        .bind(participant)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let amount: String = row.get("amount");
                amount
                    .parse::<u128>()
                    .map(Some)
                    .map_err(|e| CoordinatorError::Internal(format!("bad deposit amount: {}", e)))
            }
            None => Ok(None),
        }
    }
}

/// SQLite integers are signed; refuse values that would wrap
fn sql_int(value: u64, what: &str) -> CoordinatorResult<i64> {
    i64::try_from(value).map_err(|_| {
        CoordinatorError::Internal(format!("{} {} exceeds the store's range", what, value))
    })
}

/// Decision statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionStats {
    pub total: u64,
    pub committed: u64,
    pub aborted: u64,
    pub pending: u64,
    pub partially_applied: u64,
    pub channels_settled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(decision: Decision) -> DecisionRecord {
        let mut shards = BTreeMap::new();
        shards.insert(1, vec!["a".to_string()]);
        shards.insert(2, vec!["b".to_string(), "c".to_string()]);
        DecisionRecord::new(Uuid::new_v4(), decision, shards, [9; 32])
    }

    #[tokio::test]
    async fn test_decision_round_trip_and_delivery() {
        let state = StateManager::in_memory().await.unwrap();
        let rec = record(Decision::Commit);
        state.record_decision(&rec).await.unwrap();
        state.mark_delivered(rec.transaction_id, 1).await.unwrap();
        state.mark_delivered(rec.transaction_id, 1).await.unwrap();

        let pending = state.pending_decisions().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].shards, rec.shards);
        assert_eq!(pending[0].payload_hash, [9; 32]);
        assert_eq!(pending[0].undelivered(), vec![2]);

        state.mark_delivered(rec.transaction_id, 2).await.unwrap();
        state.set_status(rec.transaction_id, DeliveryStatus::Complete).await.unwrap();
        state.mark_anchored(rec.transaction_id).await.unwrap();
        assert!(state.pending_decisions().await.unwrap().is_empty());

        let stats = state.get_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_conflicting_decision_rejected() {
        let state = StateManager::in_memory().await.unwrap();
        let rec = record(Decision::Commit);
        state.record_decision(&rec).await.unwrap();
        // same decision again is fine
        state.record_decision(&rec).await.unwrap();

        let conflicting = DecisionRecord {
            decision: Decision::Abort,
            ..rec
        };
        assert!(state.record_decision(&conflicting).await.is_err());
    }

    #[tokio::test]
    async fn test_anchor_is_write_once() {
        let state = StateManager::in_memory().await.unwrap();
        let outcome = TransactionOutcomeRecord {
            transaction_id: Uuid::new_v4(),
            decision: Decision::Abort,
            shard_ids: vec![1, 2],
        };
        state.record_transaction_outcome(&outcome).await.unwrap();
        assert!(matches!(
            state.record_transaction_outcome(&outcome).await,
            Err(CoordinatorError::AlreadyAnchored { .. })
        ));

        let settlement = ChannelSettlementRecord {
            channel_id: [3; 32],
            final_sequence: 5,
            final_state_hash: [4; 32],
            closed_at: Utc::now(),
        };
        state.record_channel_settlement(&settlement).await.unwrap();
        assert!(state.record_channel_settlement(&settlement).await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_ids_rejected() {
        let state = StateManager::in_memory().await.unwrap();
        let rec = record(Decision::Commit);
        state.record_decision(&rec).await.unwrap();
        assert!(matches!(
            state.mark_delivered(rec.transaction_id, u64::MAX).await,
            Err(CoordinatorError::Internal(_))
        ));
        assert_eq!(state.pending_decisions().await.unwrap()[0].undelivered(), vec![1, 2]);

        let settlement = ChannelSettlementRecord {
            channel_id: [6; 32],
            final_sequence: u64::MAX,
            final_state_hash: [4; 32],
            closed_at: Utc::now(),
        };
        assert!(state.record_channel_settlement(&settlement).await.is_err());
    }

    #[tokio::test]
    async fn test_deposits() {
        let state = StateManager::in_memory().await.unwrap();
        let channel = [1u8; 32];
        assert_eq!(state.confirmed_deposit(&channel, "alice").await.unwrap(), None);

        state.record_deposit(&channel, "alice", 1_000_000_000_000_000_000_000).await.unwrap();
        assert_eq!(
            state.confirmed_deposit(&channel, "alice").await.unwrap(),
            Some(1_000_000_000_000_000_000_000)
        );
    }
}
