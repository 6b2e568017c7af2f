//! Coordinator worker registry: one record per address, guarded by a single
//! mutex the same way the connection pool guards its connection table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::net::address::Address;
use crate::net::message::WorkerInfoFields;

/// How long a worker may go without a heartbeat before [`WorkerRegistry::sweep`]
/// evicts it.
pub const WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the coordinator knows about one worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub address: Address,
    pub protocol_version: u32,
    pub platform: u8,
    pub last_heartbeat: Instant,
    pub info: Option<WorkerInfoFields>,
}

/// Filter applied to [`WorkerRegistry::snapshot`]: a `RequestWorkerList` only
/// wants to hear about workers it could actually dispatch jobs to.
#[derive(Debug, Clone, Copy)]
pub struct WorkerFilter {
    pub protocol_version: u32,
    pub platform: u8,
}

impl WorkerFilter {
    fn matches(self, record: &WorkerRecord) -> bool {
        record.protocol_version == self.protocol_version && record.platform == self.platform
    }
}

#[derive(Default)]
struct Workers {
    by_address: HashMap<Address, WorkerRecord>,
}

/// The coordinator's in-memory worker table. One record per address; a second
/// `SetWorkerStatus` from the same address replaces the first rather than adding
/// a duplicate.
pub struct WorkerRegistry {
    workers: Mutex<Workers>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Workers::default()),
        }
    }

    /// Record (or refresh) a worker as available, stamping `now` as its last
    /// heartbeat.
    pub async fn upsert_available(
        &self,
        address: Address,
        protocol_version: u32,
        platform: u8,
        now: Instant,
    ) {
        let mut workers = self.workers.lock().await;
        workers
            .by_address
            .entry(address)
            .and_modify(|r| {
                r.protocol_version = protocol_version;
                r.platform = platform;
                r.last_heartbeat = now;
            })
            .or_insert(WorkerRecord {
                address,
                protocol_version,
                platform,
                last_heartbeat: now,
                info: None,
            });
    }

    /// Remove a worker that reported itself unavailable. A no-op if it wasn't
    /// registered.
    pub async fn remove(&self, address: Address) {
        self.workers.lock().await.by_address.remove(&address);
    }

    /// Attach descriptive fields from an `UpdateWorkerInfo` message. A no-op if
    /// the worker isn't currently registered (it sent status-down in the meantime,
    /// or never registered at all).
    pub async fn update_info(&self, address: Address, info: WorkerInfoFields) {
        if let Some(record) = self.workers.lock().await.by_address.get_mut(&address) {
            record.info = Some(info);
        }
    }

    /// All currently registered workers matching `filter`, oldest-registered order
    /// not guaranteed.
    pub async fn snapshot(&self, filter: WorkerFilter) -> Vec<WorkerRecord> {
        self.workers
            .lock()
            .await
            .by_address
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// Evict every worker whose last heartbeat is older than [`WORKER_TIMEOUT`]
    /// relative to `now`. Returns the evicted addresses for logging.
    pub async fn sweep(&self, now: Instant) -> Vec<Address> {
        let mut workers = self.workers.lock().await;
        let stale: Vec<Address> = workers
            .by_address
            .values()
            .filter(|r| now.saturating_duration_since(r.last_heartbeat) >= WORKER_TIMEOUT)
            .map(|r| r.address)
            .collect();
        for addr in &stale {
            workers.by_address.remove(addr);
        }
        stale
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.by_address.len()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u32) -> Address {
        Address(n)
    }

    #[tokio::test]
    async fn upsert_then_snapshot_returns_one_record_per_address() {
        let registry = WorkerRegistry::new();
        let now = Instant::now();
        registry.upsert_available(addr(1), 1, 0, now).await;
        registry.upsert_available(addr(1), 1, 0, now).await;
        registry.upsert_available(addr(2), 1, 0, now).await;

        let snap = registry
            .snapshot(WorkerFilter {
                protocol_version: 1,
                platform: 0,
            })
            .await;
        assert_eq!(snap.len(), 2);
    }

    #[tokio::test]
    async fn snapshot_filters_by_protocol_version_and_platform() {
        let registry = WorkerRegistry::new();
        let now = Instant::now();
        registry.upsert_available(addr(1), 1, 0, now).await;
        registry.upsert_available(addr(2), 2, 0, now).await;
        registry.upsert_available(addr(3), 1, 1, now).await;

        let snap = registry
            .snapshot(WorkerFilter {
                protocol_version: 1,
                platform: 0,
            })
            .await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].address, addr(1));
    }

    #[tokio::test]
    async fn remove_excludes_worker_from_future_snapshots() {
        let registry = WorkerRegistry::new();
        let now = Instant::now();
        registry.upsert_available(addr(1), 1, 0, now).await;
        registry.remove(addr(1)).await;

        let snap = registry
            .snapshot(WorkerFilter {
                protocol_version: 1,
                platform: 0,
            })
            .await;
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn sweep_evicts_only_workers_past_the_timeout() {
        let registry = WorkerRegistry::new();
        let now = Instant::now();
        let stale_heartbeat = now - WORKER_TIMEOUT - Duration::from_secs(1);
        registry.upsert_available(addr(1), 1, 0, stale_heartbeat).await;
        registry.upsert_available(addr(2), 1, 0, now).await;

        let evicted = registry.sweep(now).await;
        assert_eq!(evicted, vec![addr(1)]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn update_info_is_a_no_op_for_unregistered_worker() {
        let registry = WorkerRegistry::new();
        registry
            .update_info(
                addr(9),
                WorkerInfoFields {
                    hostname: "ghost".into(),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(registry.len().await, 0);
    }
}
