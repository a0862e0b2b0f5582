//! Trigger outbox queue via pgmq.
//!
//! Jobs are sent by the history commit (same transaction); this module
//! covers the worker side: claim with a visibility timeout, retire on
//! success, push out the next delivery on failure, archive dead letters.
//! pgmq's archive table keeps buried jobs inspectable for audit.

use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::error;

use crate::error::{Error, Result};
use crate::store::{TriggerJob, TriggerJobPayload};
use crate::telemetry::metrics;

use super::TRIGGER_QUEUE;

impl super::Db {
    /// Create the trigger queue (idempotent). Called once at startup.
    pub async fn ensure_queue(&self) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(TRIGGER_QUEUE)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Claim the next due job, hiding it for `visibility`.
    pub async fn claim_job(&self, visibility: Duration) -> Result<Option<TriggerJob>> {
        let row = sqlx::query_as::<_, (i64, i32, serde_json::Value)>(
            "SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)",
        )
        .bind(TRIGGER_QUEUE)
        .bind(visibility.as_secs() as i32)
        .fetch_optional(self.pool())
        .await?;

        let Some((msg_id, read_ct, message)) = row else {
            return Ok(None);
        };

        let payload: TriggerJobPayload = serde_json::from_value(message)
            .map_err(|e| Error::Other(format!("bad outbox payload for msg {msg_id}: {e}")))?;

        metrics::outbox_operations().add(1, &[KeyValue::new("operation", "claim")]);

        Ok(Some(TriggerJob {
            job_id: msg_id,
            attempts: read_ct.max(0) as u32,
            payload,
        }))
    }

    /// Retire a job that ran to completion (archives it for audit).
    pub async fn retire_job(&self, job: &TriggerJob) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(TRIGGER_QUEUE)
            .bind(job.job_id)
            .execute(self.pool())
            .await?;
        metrics::outbox_operations().add(1, &[KeyValue::new("operation", "retire")]);
        Ok(())
    }

    /// Push a failed job's next delivery out by `delay`.
    pub async fn delay_job(&self, job: &TriggerJob, delay: Duration) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
            .bind(TRIGGER_QUEUE)
            .bind(job.job_id)
            .bind(delay.as_secs() as i32)
            .execute(self.pool())
            .await?;
        metrics::outbox_operations().add(1, &[KeyValue::new("operation", "delay")]);
        Ok(())
    }

    /// Remove a permanently failing job from delivery. The archive table
    /// is the durable record of what was given up on.
    pub async fn bury_job(&self, job: &TriggerJob, reason: &str) -> Result<()> {
        error!(
            trigger_id = %job.payload.trigger_id,
            action = job.payload.action.kind(),
            entity_type = %job.payload.entity_type,
            entity_id = %job.payload.entity_id,
            attempts = job.attempts,
            reason,
            "trigger job buried"
        );
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(TRIGGER_QUEUE)
            .bind(job.job_id)
            .execute(self.pool())
            .await?;
        metrics::outbox_operations().add(1, &[KeyValue::new("operation", "bury")]);
        Ok(())
    }
}
