//! In-memory work-queue provider for tests and single-process runs.
//!
//! Mirrors the Redis provider's semantics exactly: three FIFO tiers,
//! atomic pop-and-move into per-worker in-flight sets, TTL'd heartbeats,
//! and a dead-letter list. All state sits behind one mutex, so the
//! pop-and-move is trivially atomic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use nexus_shared::types::{JobEnvelope, Priority, QueueDepths, WorkerHeartbeat};
use nexus_shared::{NexusError, NexusResult};

use crate::HEARTBEAT_TTL;

#[derive(Debug, Default)]
struct QueueState {
    high: VecDeque<String>,
    normal: VecDeque<String>,
    low: VecDeque<String>,
    in_flight: HashMap<u32, Vec<String>>,
    heartbeats: HashMap<u32, (WorkerHeartbeat, Instant)>,
    dead_letter: Vec<String>,
}

impl QueueState {
    fn tier_mut(&mut self, priority: Priority) -> &mut VecDeque<String> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    /// Atomic pop-and-move: first job across tiers lands in the worker's
    /// in-flight set before the lock is released.
    fn pop_and_move(&mut self, worker_id: u32) -> Option<String> {
        for priority in Priority::ORDERED {
            if let Some(raw) = self.tier_mut(priority).pop_front() {
                self.in_flight.entry(worker_id).or_default().push(raw.clone());
                return Some(raw);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    enqueued: Arc<Notify>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enqueue(&self, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        self.lock().tier_mut(job.priority).push_back(raw);
        self.enqueued.notify_waiters();
        Ok(())
    }

    pub async fn blocking_pop(
        &self,
        worker_id: u32,
        timeout: Duration,
    ) -> NexusResult<Option<JobEnvelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(raw) = self.lock().pop_and_move(worker_id) {
                return Ok(Some(serde_json::from_str(&raw)?));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.enqueued.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    pub fn mark_in_flight(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        let mut state = self.lock();
        let entries = state.in_flight.entry(worker_id).or_default();
        if !entries.contains(&raw) {
            entries.push(raw);
        }
        Ok(())
    }

    pub fn complete(&self, worker_id: u32, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        self.remove_in_flight_raw(worker_id, &raw);
        Ok(())
    }

    pub fn requeue_front(&self, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        self.lock().tier_mut(job.priority).push_front(raw);
        self.enqueued.notify_waiters();
        Ok(())
    }

    pub fn dead_letter(&self, job: &JobEnvelope) -> NexusResult<()> {
        let raw = serde_json::to_string(job)?;
        self.lock().dead_letter.push(raw);
        Ok(())
    }

    pub fn list_in_flight(&self, worker_id: u32) -> Vec<String> {
        self.lock()
            .in_flight
            .get(&worker_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove_in_flight_raw(&self, worker_id: u32, raw: &str) {
        let mut state = self.lock();
        if let Some(entries) = state.in_flight.get_mut(&worker_id) {
            entries.retain(|entry| entry != raw);
            if entries.is_empty() {
                state.in_flight.remove(&worker_id);
            }
        }
    }

    pub fn workers_with_in_flight(&self) -> Vec<u32> {
        self.lock().in_flight.keys().copied().collect()
    }

    pub fn queue_depths(&self) -> QueueDepths {
        let state = self.lock();
        QueueDepths {
            high_priority: state.high.len() as u64,
            normal_priority: state.normal.len() as u64,
            low_priority: state.low.len() as u64,
        }
    }

    pub fn dead_letter_depth(&self) -> u64 {
        self.lock().dead_letter.len() as u64
    }

    pub fn list_dead_letters(&self) -> NexusResult<Vec<JobEnvelope>> {
        self.lock()
            .dead_letter
            .iter()
            .map(|raw| serde_json::from_str(raw).map_err(NexusError::from))
            .collect()
    }

    pub fn set_heartbeat(&self, heartbeat: &WorkerHeartbeat) {
        self.lock().heartbeats.insert(
            heartbeat.worker_id,
            (heartbeat.clone(), Instant::now() + HEARTBEAT_TTL),
        );
    }

    pub fn get_heartbeat(&self, worker_id: u32) -> Option<WorkerHeartbeat> {
        let mut state = self.lock();
        match state.heartbeats.get(&worker_id) {
            Some((heartbeat, expiry)) if *expiry > Instant::now() => Some(heartbeat.clone()),
            Some(_) => {
                state.heartbeats.remove(&worker_id);
                None
            }
            None => None,
        }
    }

    pub fn clear_heartbeat(&self, worker_id: u32) {
        self.lock().heartbeats.remove(&worker_id);
    }

    pub fn workers_online(&self) -> u32 {
        let now = Instant::now();
        self.lock()
            .heartbeats
            .values()
            .filter(|(_, expiry)| *expiry > now)
            .count() as u32
    }

    pub fn purge(&self) {
        let mut state = self.lock();
        *state = QueueState::default();
    }
}
