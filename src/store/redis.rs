//! Redis session store
//!
//! Production [`SessionStore`] shared by every coordinator process. Session
//! state lives in the `session:<id>` hash, the lock is a `SET NX PX` string
//! released by a compare-and-delete script, and result documents are read
//! with RedisJSON's `JSON.GET`.

use super::{
    lock_key, session_key, validate_party_ids, ContainerStatus, LockToken, SessionStore,
    FIELD_CONTAINER_ID, FIELD_CONTAINER_STATUS, FIELD_PARTY_IDS, STATUS_RUNNING,
};
use crate::error::{CoordResult, CoordinatorError};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

/// Delete the lock only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl From<redis::RedisError> for CoordinatorError {
    fn from(err: redis::RedisError) -> Self {
        CoordinatorError::Store(err.to_string())
    }
}

/// Redis-backed session store
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to `redis://host:port/db`
    pub async fn connect(url: &str) -> CoordResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        tracing::info!(url = %url, "Connected to session store");
        Ok(Self { conn })
    }

    fn decode_parties(session_id: &str, raw: &str) -> CoordResult<Vec<String>> {
        serde_json::from_str(raw).map_err(|e| {
            CoordinatorError::Store(format!(
                "party_ids of session '{}' is not a JSON string array: {}",
                session_id, e
            ))
        })
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn get_status(&self, session_id: &str) -> CoordResult<ContainerStatus> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(session_key(session_id)).await?;

        ContainerStatus::from_fields(
            session_id,
            fields.get(FIELD_CONTAINER_STATUS).map(String::as_str),
            fields.get(FIELD_CONTAINER_ID).map(String::as_str),
        )
    }

    async fn record_running(&self, session_id: &str, container_id: &str) -> CoordResult<()> {
        if container_id.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "container_id must not be empty".to_string(),
            ));
        }

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                session_key(session_id),
                &[
                    (FIELD_CONTAINER_STATUS, STATUS_RUNNING),
                    (FIELD_CONTAINER_ID, container_id),
                ],
            )
            .await?;
        Ok(())
    }

    async fn register_parties(&self, session_id: &str, party_ids: &[String]) -> CoordResult<()> {
        validate_party_ids(session_id, party_ids)?;

        let encoded = serde_json::to_string(party_ids)
            .map_err(|e| CoordinatorError::InvalidArgument(e.to_string()))?;

        let mut conn = self.conn.clone();
        let key = session_key(session_id);
        let created: bool = conn.hset_nx(&key, FIELD_PARTY_IDS, &encoded).await?;
        if created {
            return Ok(());
        }

        let existing: Option<String> = conn.hget(&key, FIELD_PARTY_IDS).await?;
        let existing = match existing {
            Some(raw) => Self::decode_parties(session_id, &raw)?,
            None => {
                return Err(CoordinatorError::Store(format!(
                    "party_ids of session '{}' vanished during registration",
                    session_id
                )))
            }
        };

        if existing.as_slice() == party_ids {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidArgument(format!(
                "session '{}' is already initiated with parties {:?}",
                session_id, existing
            )))
        }
    }

    async fn get_parties(&self, session_id: &str) -> CoordResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(session_key(session_id), FIELD_PARTY_IDS).await?;

        match raw {
            Some(raw) => Self::decode_parties(session_id, &raw),
            None => Err(CoordinatorError::NotFound(format!(
                "party list for session '{}'",
                session_id
            ))),
        }
    }

    async fn try_lock(&self, session_id: &str, ttl: Duration) -> CoordResult<Option<LockToken>> {
        let token = LockToken::generate();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(session_id))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(reply.map(|_| token))
    }

    async fn unlock(&self, session_id: &str, token: &LockToken) -> CoordResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(lock_key(session_id))
            .arg(token.as_str())
            .query_async(&mut conn)
            .await?;

        Ok(deleted == 1)
    }

    async fn get_result_document(&self, key: &str) -> CoordResult<Option<String>> {
        let mut conn = self.conn.clone();
        let doc: Option<String> = redis::cmd("JSON.GET").arg(key).query_async(&mut conn).await?;
        Ok(doc)
    }
}
