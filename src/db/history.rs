//! History log operations: the compare-and-append and the reads around it.
//!
//! `commit` is the engine's only stateful write. The unique constraint on
//! (entity_type, entity_id, machine_id, sequence_no) turns a lost race into
//! a unique violation, reported as `SequenceConflict`; outbox jobs are sent
//! to pgmq inside the same transaction so they exist iff the record does.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{EntityKey, HistoryQuery, HistoryRecord, MachineId, NewHistoryRecord, StateId};
use crate::store::TriggerJobPayload;

use super::TRIGGER_QUEUE;

const SELECT_RECORD: &str = "SELECT id, entity_type, entity_id, machine_id, state_id, from_state_id, event_name, context, triggered_by, idempotency_token, sequence_no, occurred_at FROM entity_history";

impl super::Db {
    /// The key's highest-sequence record, or None for an uninitialized key.
    pub async fn last_record(&self, key: &EntityKey) -> Result<Option<HistoryRecord>> {
        let row: Option<HistoryRow> = sqlx::query_as(&format!(
            "{SELECT_RECORD}
             WHERE entity_type = $1 AND entity_id = $2 AND machine_id = $3
             ORDER BY sequence_no DESC LIMIT 1"
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(key.machine_id.0)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(HistoryRow::into_record))
    }

    /// Compare-and-append: insert the record and send its outbox jobs in
    /// one transaction.
    pub async fn commit(
        &self,
        record: NewHistoryRecord,
        jobs: Vec<TriggerJobPayload>,
    ) -> Result<HistoryRecord> {
        let mut tx = self.pool().begin().await?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO entity_history (id, entity_type, entity_id, machine_id, state_id, from_state_id, event_name, context, triggered_by, idempotency_token, sequence_no, occurred_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(id)
        .bind(&record.key.entity_type)
        .bind(&record.key.entity_id)
        .bind(record.key.machine_id.0)
        .bind(record.state_id.0)
        .bind(record.from_state_id.map(|s| s.0))
        .bind(&record.event_name)
        .bind(&record.context)
        .bind(&record.triggered_by)
        .bind(&record.idempotency_token)
        .bind(record.sequence_no)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(ref e) = inserted {
            // Either uniqueness backstop means another writer got there
            // first; the engine decides whether that is a conflict or an
            // idempotent replay.
            let constraint = match e {
                sqlx::Error::Database(db) => db.constraint(),
                _ => None,
            };
            if matches!(
                constraint,
                Some("entity_history_key_seq") | Some("entity_history_key_token")
            ) {
                return Err(Error::SequenceConflict {
                    key: record.key,
                    attempted: record.sequence_no,
                });
            }
        }
        inserted?;

        for payload in &jobs {
            let message = serde_json::to_value(payload)?;
            let _msg_id: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
                .bind(TRIGGER_QUEUE)
                .bind(&message)
                .bind(0i32)
                .fetch_one(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(HistoryRecord {
            id,
            entity_type: record.key.entity_type,
            entity_id: record.key.entity_id,
            machine_id: record.key.machine_id,
            state_id: record.state_id,
            from_state_id: record.from_state_id,
            event_name: record.event_name,
            context: record.context,
            triggered_by: record.triggered_by,
            idempotency_token: record.idempotency_token,
            sequence_no: record.sequence_no,
            occurred_at: now,
        })
    }

    /// A key's records in sequence order, restartable via the query's
    /// `after_sequence`.
    pub async fn history(
        &self,
        key: &EntityKey,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoryRecord>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(&format!(
            "{SELECT_RECORD}
             WHERE entity_type = $1 AND entity_id = $2 AND machine_id = $3 AND sequence_no > $4
             ORDER BY sequence_no ASC LIMIT $5"
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(key.machine_id.0)
        .bind(query.after_sequence)
        .bind(query.limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(HistoryRow::into_record).collect())
    }

    /// The record previously committed with this idempotency token, if any.
    pub async fn record_by_token(
        &self,
        key: &EntityKey,
        token: &str,
    ) -> Result<Option<HistoryRecord>> {
        let row: Option<HistoryRow> = sqlx::query_as(&format!(
            "{SELECT_RECORD}
             WHERE entity_type = $1 AND entity_id = $2 AND machine_id = $3 AND idempotency_token = $4"
        ))
        .bind(&key.entity_type)
        .bind(&key.entity_id)
        .bind(key.machine_id.0)
        .bind(token)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(HistoryRow::into_record))
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    entity_type: String,
    entity_id: String,
    machine_id: Uuid,
    state_id: Uuid,
    from_state_id: Option<Uuid>,
    event_name: String,
    context: serde_json::Value,
    triggered_by: String,
    idempotency_token: Option<String>,
    sequence_no: i64,
    occurred_at: chrono::DateTime<chrono::Utc>,
}

impl HistoryRow {
    fn into_record(self) -> HistoryRecord {
        HistoryRecord {
            id: self.id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            machine_id: MachineId(self.machine_id),
            state_id: StateId(self.state_id),
            from_state_id: self.from_state_id.map(StateId),
            event_name: self.event_name,
            context: self.context,
            triggered_by: self.triggered_by,
            idempotency_token: self.idempotency_token,
            sequence_no: self.sequence_no,
            occurred_at: self.occurred_at,
        }
    }
}
