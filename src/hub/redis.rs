use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::routing::{RouteClaim, RoutingError, RoutingTable};

const KEY_PREFIX: &str = "fleetd:route:";

// An empty ARGV[1] means "expect no entry".
const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
if (ARGV[1] == '' and not cur) or (cur == ARGV[1]) then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
end
return 0
"#;

const CAD_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Routing table shared between processes through Redis.
///
/// Entries carry a TTL (3x the heartbeat interval), refreshed on every
/// heartbeat, so the claims of a crashed process lapse on their own.
#[derive(Clone)]
pub struct RedisRoutingTable {
    conn: ConnectionManager,
    cas: Script,
    cad: Script,
    refresh: Script,
}

impl RedisRoutingTable {
    pub async fn connect(url: &str) -> Result<Self, RoutingError> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self {
            conn,
            cas: Script::new(CAS_SCRIPT),
            cad: Script::new(CAD_SCRIPT),
            refresh: Script::new(REFRESH_SCRIPT),
        })
    }

    fn key(agent_id: &str) -> String {
        format!("{KEY_PREFIX}{agent_id}")
    }
}

fn store_err(e: redis::RedisError) -> RoutingError {
    RoutingError::Store(e.to_string())
}

fn encode(claim: &RouteClaim) -> Result<String, RoutingError> {
    serde_json::to_string(claim).map_err(|e| RoutingError::Codec(e.to_string()))
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

#[async_trait]
impl RoutingTable for RedisRoutingTable {
    async fn owner(&self, agent_id: &str) -> Result<Option<RouteClaim>, RoutingError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(agent_id))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(|e| RoutingError::Codec(e.to_string())))
            .transpose()
    }

    async fn compare_and_set(
        &self,
        agent_id: &str,
        expected: Option<&RouteClaim>,
        claim: &RouteClaim,
        ttl: Duration,
    ) -> Result<bool, RoutingError> {
        let mut conn = self.conn.clone();
        let expected = match expected {
            Some(c) => encode(c)?,
            None => String::new(),
        };
        let swapped: i64 = self
            .cas
            .key(Self::key(agent_id))
            .arg(expected)
            .arg(encode(claim)?)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(
        &self,
        agent_id: &str,
        expected: &RouteClaim,
    ) -> Result<bool, RoutingError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .cad
            .key(Self::key(agent_id))
            .arg(encode(expected)?)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted == 1)
    }

    async fn refresh(
        &self,
        agent_id: &str,
        claim: &RouteClaim,
        ttl: Duration,
    ) -> Result<bool, RoutingError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh
            .key(Self::key(agent_id))
            .arg(encode(claim)?)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(refreshed == 1)
    }
}
