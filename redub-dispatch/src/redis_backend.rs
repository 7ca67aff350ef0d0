use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Value;
use tracing::{debug, warn};

use redub_core::{ClaimToken, ConsumerId, JobId};
use redub_store::JobPriority;

use crate::error::{DispatchError, DispatchResult};
use crate::{Claimed, DispatchBackend, Health, Submission};

const PROMOTE_BATCH: usize = 32;

/// Redis-streams dispatch backend: one durable stream consumed through a
/// consumer group, plus a sorted set holding delayed submissions until
/// they become eligible.
///
/// The claim token is the stream entry ID; ack maps onto `XACK`. Crash
/// recovery comes from the consumer group's pending-entries list: entries
/// idle past the visibility TTL are reclaimed by whoever asks next.
pub struct RedisDispatch {
    conn: ConnectionManager,
    stream_key: String,
    delayed_key: String,
    group: String,
}

impl RedisDispatch {
    pub async fn connect(url: &str) -> DispatchResult<Self> {
        let client = redis::Client::open(url).map_err(DispatchError::from)?;
        let conn = client.get_connection_manager().await?;
        let backend = Self {
            conn,
            stream_key: "redub:dispatch:stream".to_string(),
            delayed_key: "redub:dispatch:delayed".to_string(),
            group: "redub-workers".to_string(),
        };
        backend.ensure_group().await?;
        Ok(backend)
    }

    async fn ensure_group(&self) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn append_entry(&self, submission: &Submission) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let _id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(submission.job_id.as_str())
            .arg("priority")
            .arg(submission.priority.as_u8() as i64)
            .arg("submitted_at")
            .arg(submission.submitted_at.timestamp_millis())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move due delayed submissions from the sorted set onto the stream.
    async fn promote_due(&self) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        for member in due {
            let submission: Option<Submission> = serde_json::from_str::<DelayedEntry>(&member)
                .ok()
                .map(DelayedEntry::into_submission);
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            // Only the connection that wins the ZREM appends, so a delayed
            // entry is promoted exactly once across instances.
            if removed > 0 {
                if let Some(submission) = submission {
                    self.append_entry(&submission).await?;
                } else {
                    warn!(member, "dropping malformed delayed dispatch entry");
                }
            }
        }
        Ok(())
    }

    /// Reclaim entries stuck in other consumers' pending lists past the
    /// visibility TTL.
    async fn reclaim(
        &self,
        consumer: &ConsumerId,
        n: usize,
        visibility_ttl: Duration,
    ) -> DispatchResult<Vec<Claimed>> {
        let mut conn = self.conn.clone();
        let idle_ms = visibility_ttl.as_millis() as i64;

        let pending: Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(n as i64)
            .query_async(&mut conn)
            .await?;

        let ids: Vec<String> = match &pending {
            Value::Array(rows) => rows
                .iter()
                .filter_map(|row| match row {
                    Value::Array(cols) => cols.first().and_then(as_string),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.stream_key)
            .arg(&self.group)
            .arg(consumer.as_str())
            .arg(idle_ms);
        for id in &ids {
            cmd.arg(id);
        }
        let claimed: Value = cmd.query_async(&mut conn).await?;
        Ok(parse_entries(&claimed))
    }
}

/// Wire form of a delayed submission in the sorted set.
#[derive(serde::Serialize, serde::Deserialize)]
struct DelayedEntry {
    job_id: String,
    priority: u8,
    submitted_at_ms: i64,
}

impl DelayedEntry {
    fn from_submission(sub: &Submission) -> Self {
        Self {
            job_id: sub.job_id.to_string(),
            priority: sub.priority.as_u8(),
            submitted_at_ms: sub.submitted_at.timestamp_millis(),
        }
    }

    fn into_submission(self) -> Submission {
        let now = Utc::now();
        Submission {
            job_id: JobId::from_string(self.job_id),
            priority: JobPriority::from_u8(self.priority).unwrap_or_default(),
            available_at: now,
            submitted_at: chrono::DateTime::<Utc>::from_timestamp_millis(self.submitted_at_ms)
                .unwrap_or(now),
        }
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Parse `[[entry_id, [field, value, ...]], ...]` replies (XCLAIM,
/// XREADGROUP inner entries) into claims. Entries without a `job_id`
/// field are skipped.
fn parse_entries(value: &Value) -> Vec<Claimed> {
    let Value::Array(rows) = value else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let Value::Array(cols) = row else { return None };
            let entry_id = cols.first().and_then(as_string)?;
            let Some(Value::Array(fields)) = cols.get(1) else {
                return None;
            };
            let mut job_id = None;
            let mut iter = fields.iter();
            while let (Some(key), Some(val)) = (iter.next(), iter.next()) {
                if as_string(key).as_deref() == Some("job_id") {
                    job_id = as_string(val);
                }
            }
            Some(Claimed {
                job_id: JobId::from_string(job_id?),
                token: ClaimToken::from_string(entry_id),
                backend: "redis",
            })
        })
        .collect()
}

#[async_trait]
impl DispatchBackend for RedisDispatch {
    async fn submit(&self, submission: Submission) -> DispatchResult<()> {
        if submission.available_at <= Utc::now() {
            self.append_entry(&submission).await
        } else {
            let mut conn = self.conn.clone();
            let member = serde_json::to_string(&DelayedEntry::from_submission(&submission))
                .map_err(|e| DispatchError::Backend(e.to_string()))?;
            let _added: i64 = redis::cmd("ZADD")
                .arg(&self.delayed_key)
                .arg(submission.available_at.timestamp_millis())
                .arg(member)
                .query_async(&mut conn)
                .await?;
            Ok(())
        }
    }

    async fn claim(
        &self,
        consumer: &ConsumerId,
        n: usize,
        wait: Duration,
        visibility_ttl: Duration,
    ) -> DispatchResult<Vec<Claimed>> {
        self.promote_due().await?;

        let reclaimed = self.reclaim(consumer, n, visibility_ttl).await?;
        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed idle dispatch entries");
            return Ok(reclaimed);
        }

        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer.as_str())
            .arg("COUNT")
            .arg(n as i64)
            .arg("BLOCK")
            .arg(wait.as_millis() as i64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        // Reply shape: [[stream_name, [[id, fields], ...]]] or nil.
        let claims = match &reply {
            Value::Array(streams) => streams
                .iter()
                .flat_map(|stream| match stream {
                    Value::Array(cols) if cols.len() >= 2 => parse_entries(&cols[1]),
                    _ => Vec::new(),
                })
                .collect(),
            _ => Vec::new(),
        };
        Ok(claims)
    }

    async fn ack(&self, claim: &Claimed) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let _acked: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(claim.token.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, claim: &Claimed, delay: Duration) -> DispatchResult<()> {
        // Settle the pending entry, then re-publish with the delay; the
        // visibility TTL would eventually reclaim it anyway, this is just
        // prompter.
        self.ack(claim).await?;
        self.submit(Submission::delayed(
            claim.job_id.clone(),
            JobPriority::default(),
            delay,
        ))
        .await
    }

    async fn health(&self) -> Health {
        let mut conn = self.conn.clone();
        let pong: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => Health::Ok,
            Err(_) => Health::Degraded,
        }
    }

    async fn depth(&self) -> DispatchResult<usize> {
        let mut conn = self.conn.clone();
        let stream_len: i64 = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query_async(&mut conn)
            .await?;
        let delayed: i64 = redis::cmd("ZCARD")
            .arg(&self.delayed_key)
            .query_async(&mut conn)
            .await?;
        Ok((stream_len + delayed).max(0) as usize)
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn close(&self) {
        // ConnectionManager tears down with the last clone.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_parser_handles_the_stream_reply_shape() {
        let entries = Value::Array(vec![Value::Array(vec![
            Value::BulkString(b"1700000000000-0".to_vec()),
            Value::Array(vec![
                Value::BulkString(b"job_id".to_vec()),
                Value::BulkString(b"job_abc".to_vec()),
                Value::BulkString(b"priority".to_vec()),
                Value::BulkString(b"3".to_vec()),
            ]),
        ])]);

        let claims = parse_entries(&entries);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].job_id.as_str(), "job_abc");
        assert_eq!(claims[0].token.as_str(), "1700000000000-0");
    }

    #[test]
    fn entry_parser_skips_malformed_rows() {
        let entries = Value::Array(vec![
            Value::Nil,
            Value::Array(vec![Value::BulkString(b"id-only".to_vec())]),
            Value::Array(vec![
                Value::BulkString(b"1-1".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"other".to_vec()),
                    Value::BulkString(b"field".to_vec()),
                ]),
            ]),
        ]);
        assert!(parse_entries(&entries).is_empty());
    }

    #[test]
    fn delayed_entry_round_trips() {
        let submission = Submission::now(JobId::from("job_d"), JobPriority::High);
        let wire = serde_json::to_string(&DelayedEntry::from_submission(&submission)).unwrap();
        let back: DelayedEntry = serde_json::from_str(&wire).unwrap();
        let restored = back.into_submission();
        assert_eq!(restored.job_id, submission.job_id);
        assert_eq!(restored.priority, JobPriority::High);
    }
}
