//! Redis work-queue provider.
//!
//! Three priority lists plus per-worker in-flight sets. The pop is a Lua
//! script so the envelope moves from a queue list into the worker's
//! in-flight set in one atomic round-trip; a task id can therefore never
//! be observed in a queue and an in-flight set at the same moment.

use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use nexus_shared::types::{JobEnvelope, QueueDepths, WorkerHeartbeat};
use nexus_shared::{NexusError, NexusResult};

use crate::router::KeyRouter;
use crate::HEARTBEAT_TTL;

/// Interval between atomic pop attempts while a blocking pop waits
const POP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// LPOP from the first non-empty tier and SADD into the in-flight set,
/// atomically. KEYS = [high, normal, low, processing].
const POP_AND_MOVE_SCRIPT: &str = r#"
for i = 1, #KEYS - 1 do
  local v = redis.call('LPOP', KEYS[i])
  if v then
    redis.call('SADD', KEYS[#KEYS], v)
    return v
  end
end
return false
"#;

#[derive(Clone)]
pub struct RedisWorkQueue {
    manager: ConnectionManager,
    router: KeyRouter,
    pop_script: redis::Script,
}

impl std::fmt::Debug for RedisWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWorkQueue").finish()
    }
}

impl RedisWorkQueue {
    pub async fn connect(redis_url: &str, router: KeyRouter) -> NexusResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| NexusError::Configuration(format!("invalid redis url: {e}")))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            router,
            pop_script: redis::Script::new(POP_AND_MOVE_SCRIPT),
        })
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn enqueue(&self, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        let key = self.router.queue_key(job.priority);
        let mut conn = self.conn();
        let _: i64 = conn.rpush(&key, raw).await?;
        Ok(())
    }

    /// Atomic pop-and-move scanning high → normal → low against the
    /// combined deadline.
    pub async fn blocking_pop(
        &self,
        worker_id: u32,
        timeout: Duration,
    ) -> NexusResult<Option<JobEnvelope>> {
        let deadline = Instant::now() + timeout;
        let [high, normal, low] = self.router.queue_keys();
        let processing = self.router.processing_key(worker_id);

        loop {
            let mut conn = self.conn();
            let popped: Option<String> = self
                .pop_script
                .key(&high)
                .key(&normal)
                .key(&low)
                .key(&processing)
                .invoke_async(&mut conn)
                .await?;

            if let Some(raw) = popped {
                debug!(worker_id, "popped job into in-flight set");
                return Ok(Some(serde_json::from_str(&raw)?));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(POP_POLL_INTERVAL)).await;
        }
    }

    pub async fn mark_in_flight(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        let key = self.router.processing_key(worker_id);
        let mut conn = self.conn();
        let _: i64 = conn.sadd(&key, raw).await?;
        Ok(())
    }

    pub async fn complete(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        self.remove_in_flight_raw(worker_id, &raw).await
    }

    pub async fn requeue_front(&self, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        let key = self.router.queue_key(job.priority);
        let mut conn = self.conn();
        let _: i64 = conn.lpush(&key, raw).await?;
        Ok(())
    }

    pub async fn dead_letter(&self, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        let key = self.router.dead_letter_key();
        let mut conn = self.conn();
        let _: i64 = conn.rpush(&key, raw).await?;
        Ok(())
    }

    pub async fn list_in_flight(&self, worker_id: u32) -> NexusResult<Vec<String>> {
        let key = self.router.processing_key(worker_id);
        let mut conn = self.conn();
        let members: Vec<String> = conn.smembers(&key).await?;
        Ok(members)
    }

    pub async fn remove_in_flight_raw(&self, worker_id: u32, raw: &str) -> NexusResult<()> {
        let key = self.router.processing_key(worker_id);
        let mut conn = self.conn();
        let _: i64 = conn.srem(&key, raw).await?;
        Ok(())
    }

    pub async fn workers_with_in_flight(&self) -> NexusResult<Vec<u32>> {
        let keys = self.scan_keys(&self.router.processing_pattern()).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.router.worker_id_from_processing_key(key))
            .collect())
    }

    pub async fn queue_depths(&self) -> NexusResult<QueueDepths> {
        let [high, normal, low] = self.router.queue_keys();
        let mut conn = self.conn();
        let (high_priority, normal_priority, low_priority): (u64, u64, u64) = redis::pipe()
            .llen(&high)
            .llen(&normal)
            .llen(&low)
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepths {
            high_priority,
            normal_priority,
            low_priority,
        })
    }

    pub async fn dead_letter_depth(&self) -> NexusResult<u64> {
        let mut conn = self.conn();
        let depth: u64 = conn.llen(self.router.dead_letter_key()).await?;
        Ok(depth)
    }

    pub async fn list_dead_letters(&self) -> NexusResult<Vec<JobEnvelope>> {
        let mut conn = self.conn();
        let raws: Vec<String> = conn.lrange(self.router.dead_letter_key(), 0, -1).await?;
        raws.iter()
            .map(|raw| serde_json::from_str(raw).map_err(NexusError::from))
            .collect()
    }

    pub async fn set_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> NexusResult<()> {
        let key = self.router.heartbeat_key(heartbeat.worker_id);
        let raw = serde_json::to_string(heartbeat)?;
        let mut conn = self.conn();
        let _: () = conn.set_ex(&key, raw, HEARTBEAT_TTL.as_secs()).await?;
        Ok(())
    }

    pub async fn get_heartbeat(&self, worker_id: u32) -> NexusResult<Option<WorkerHeartbeat>> {
        let key = self.router.heartbeat_key(worker_id);
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(&key).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn clear_heartbeat(&self, worker_id: u32) -> NexusResult<()> {
        let key = self.router.heartbeat_key(worker_id);
        let mut conn = self.conn();
        let _: i64 = conn.del(&key).await?;
        Ok(())
    }

    pub async fn workers_online(&self) -> NexusResult<u32> {
        let keys = self.scan_keys(&self.router.heartbeat_pattern()).await?;
        Ok(keys.len() as u32)
    }

    /// Delete every queue-owned key. Callers gate this behind the
    /// confirmation token; the provider just executes.
    pub async fn purge(&self) -> NexusResult<()> {
        let mut keys: Vec<String> = self.router.queue_keys().to_vec();
        keys.push(self.router.dead_letter_key());
        keys.extend(self.scan_keys(&self.router.processing_pattern()).await?);
        keys.extend(self.scan_keys(&self.router.heartbeat_pattern()).await?);
        let mut conn = self.conn();
        let _: i64 = conn.del(keys).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> NexusResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}
