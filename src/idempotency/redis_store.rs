use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;

use crate::idempotency::request::StoredResponse;
use crate::idempotency::specification::{Fingerprint, LookupKey};
use crate::idempotency::storage::{
    lock_stamp, IdempotencyStore, IdempotentRequestRecord, StorageError, StorageResult,
};

const FIELD_FINGERPRINT: &str = "fingerprint";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_LOCKED_AT: &str = "locked_at";
const FIELD_RESPONSE: &str = "response";

// Script replies: 1 applied, 0 missing, -1 already has a response, -2 lock mismatch.

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'fingerprint', ARGV[1], 'created_at', ARGV[2])
if tonumber(ARGV[3]) > 0 then redis.call('EXPIRE', KEYS[1], ARGV[3]) end
return 1
"#;

const LOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HEXISTS', KEYS[1], 'response') == 1 then return -1 end
local held = redis.call('HGET', KEYS[1], 'locked_at') or ''
if held ~= ARGV[1] then return -2 end
redis.call('HSET', KEYS[1], 'locked_at', ARGV[2])
return 1
"#;

const SET_RESPONSE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HEXISTS', KEYS[1], 'response') == 1 then return -1 end
local held = redis.call('HGET', KEYS[1], 'locked_at') or ''
if held == '' or held ~= ARGV[1] then return -2 end
redis.call('HSET', KEYS[1], 'response', ARGV[2])
redis.call('HDEL', KEYS[1], 'locked_at')
return 1
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local held = redis.call('HGET', KEYS[1], 'locked_at') or ''
if held == '' or held ~= ARGV[1] then return -2 end
redis.call('HDEL', KEYS[1], 'locked_at')
return 1
"#;

/// Redis-backed store: one hash per record, with every state transition done
/// by a Lua script so compare-and-set is atomic on the server.
pub struct RedisIdempotencyStore {
    client: redis::Client,
    key_prefix: String,
    ttl_seconds: i64,
    create_script: redis::Script,
    lock_script: redis::Script,
    set_response_script: redis::Script,
    unlock_script: redis::Script,
}

impl RedisIdempotencyStore {
    /// `ttl_seconds <= 0` keeps records until evicted by Redis itself.
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            ttl_seconds,
            create_script: redis::Script::new(CREATE_SCRIPT),
            lock_script: redis::Script::new(LOCK_SCRIPT),
            set_response_script: redis::Script::new(SET_RESPONSE_SCRIPT),
            unlock_script: redis::Script::new(UNLOCK_SCRIPT),
        }
    }

    fn make_key(&self, lookup_key: &LookupKey) -> String {
        format!("{}:{}", self.key_prefix, lookup_key)
    }

    async fn connection(&self) -> StorageResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn check_reply(reply: i64, lookup_key: &LookupKey) -> StorageResult<()> {
        match reply {
            1 => Ok(()),
            0 => Err(StorageError::NotFound {
                lookup_key: lookup_key.clone(),
            }),
            -1 => Err(StorageError::AlreadyCompleted {
                lookup_key: lookup_key.clone(),
            }),
            -2 => Err(StorageError::LockContention {
                lookup_key: lookup_key.clone(),
            }),
            other => Err(StorageError::Backend(format!(
                "unexpected script reply {} for '{}'",
                other, lookup_key
            ))),
        }
    }
}

fn format_stamp(stamp: &DateTime<Utc>) -> String {
    stamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(lookup_key: &LookupKey, field: &str, value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|stamp| stamp.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupted {
            lookup_key: lookup_key.clone(),
            reason: format!("invalid {}: {}", field, e),
        })
}

fn observed_lock(record: &IdempotentRequestRecord) -> String {
    record.locked_at.as_ref().map(format_stamp).unwrap_or_default()
}

/// Rebuilds a record from its hash fields. An empty hash means no record.
fn decode_record(
    lookup_key: &LookupKey,
    fields: HashMap<String, String>,
) -> StorageResult<Option<IdempotentRequestRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let created_at = match fields.get(FIELD_CREATED_AT) {
        Some(value) => parse_stamp(lookup_key, FIELD_CREATED_AT, value)?,
        None => {
            return Err(StorageError::Corrupted {
                lookup_key: lookup_key.clone(),
                reason: "missing created_at".to_string(),
            })
        }
    };

    let locked_at = fields
        .get(FIELD_LOCKED_AT)
        .filter(|value| !value.is_empty())
        .map(|value| parse_stamp(lookup_key, FIELD_LOCKED_AT, value))
        .transpose()?;

    let response = fields
        .get(FIELD_RESPONSE)
        .map(|value| serde_json::from_str::<StoredResponse>(value))
        .transpose()?;

    Ok(Some(IdempotentRequestRecord {
        lookup_key: lookup_key.clone(),
        fingerprint: fields.get(FIELD_FINGERPRINT).map(Fingerprint::new),
        locked_at,
        response,
        created_at,
    }))
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, lookup_key: &LookupKey) -> StorageResult<Option<IdempotentRequestRecord>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.make_key(lookup_key)).await?;
        decode_record(lookup_key, fields)
    }

    async fn create(
        &self,
        lookup_key: &LookupKey,
        fingerprint: &Fingerprint,
    ) -> StorageResult<IdempotentRequestRecord> {
        let mut conn = self.connection().await?;
        let key = self.make_key(lookup_key);

        let created: i64 = self
            .create_script
            .key(&key)
            .arg(fingerprint.as_str())
            .arg(format_stamp(&lock_stamp()))
            .arg(self.ttl_seconds.max(0))
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            tracing::debug!(lookup_key = %lookup_key, "Record already existed on create");
        }

        let fields: HashMap<String, String> = conn.hgetall(&key).await?;
        decode_record(lookup_key, fields)?.ok_or_else(|| StorageError::NotFound {
            lookup_key: lookup_key.clone(),
        })
    }

    async fn lock(&self, record: &IdempotentRequestRecord) -> StorageResult<IdempotentRequestRecord> {
        let mut conn = self.connection().await?;

        let mut stamp = lock_stamp();
        if let Some(previous) = record.locked_at {
            if stamp <= previous {
                stamp = previous + Duration::microseconds(1);
            }
        }

        let reply: i64 = self
            .lock_script
            .key(self.make_key(&record.lookup_key))
            .arg(observed_lock(record))
            .arg(format_stamp(&stamp))
            .invoke_async(&mut conn)
            .await?;
        Self::check_reply(reply, &record.lookup_key)?;

        Ok(IdempotentRequestRecord {
            locked_at: Some(stamp),
            ..record.clone()
        })
    }

    async fn set_response_and_unlock(
        &self,
        record: &IdempotentRequestRecord,
        response: &StoredResponse,
    ) -> StorageResult<IdempotentRequestRecord> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(response)?;

        let reply: i64 = self
            .set_response_script
            .key(self.make_key(&record.lookup_key))
            .arg(observed_lock(record))
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Self::check_reply(reply, &record.lookup_key)?;

        Ok(IdempotentRequestRecord {
            locked_at: None,
            response: Some(response.clone()),
            ..record.clone()
        })
    }

    async fn unlock(&self, record: &IdempotentRequestRecord) -> StorageResult<()> {
        let mut conn = self.connection().await?;

        let reply: i64 = self
            .unlock_script
            .key(self.make_key(&record.lookup_key))
            .arg(observed_lock(record))
            .invoke_async(&mut conn)
            .await?;
        Self::check_reply(reply, &record.lookup_key)
    }

    async fn ping(&self) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis_store"
    }
}
