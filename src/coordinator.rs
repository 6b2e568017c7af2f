//! Coordinator service: binds the listening port, then runs a 500ms tick loop
//! that dispatches incoming messages and runs the 10s worker-timeout sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;

use crate::error::Result;
use crate::net::address::Address;
use crate::net::message::{Message, WorkerListEntry};
use crate::net::pool::{ConnectionPool, Handler};
use crate::registry::{WorkerFilter, WorkerRegistry};

/// Fixed compile-time port the coordinator listens on.
pub const COORDINATOR_PORT: u16 = 31264;

/// Tick cadence for the coordinator's main loop.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// How often the main loop runs [`WorkerRegistry::sweep`].
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Exit code used by the caller when [`CoordinatorService::run`] fails to bind.
pub const EXIT_CODE_BIND_FAILED: i32 = -3;

struct Dispatch {
    registry: Arc<WorkerRegistry>,
    /// Set once, right after the pool is constructed; the per-connection worker
    /// tasks need it to send replies but `on_receive` is a synchronous callback,
    /// so this can't be a tokio mutex.
    pool: OnceLock<Arc<ConnectionPool<Dispatch>>>,
    /// One ordered queue per live connection, so two messages arriving in order
    /// on the same socket (e.g. a status update immediately followed by an info
    /// update) are always processed in that order rather than by racing tasks.
    queues: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Message>>>,
}

impl Dispatch {
    async fn process(registry: &WorkerRegistry, pool: Option<&Arc<ConnectionPool<Dispatch>>>, addr: SocketAddr, msg: Message) {
        let address = socket_addr_to_address(addr);
        match msg {
            Message::SetWorkerStatus {
                is_available,
                protocol_version,
                platform,
            } => {
                if is_available {
                    registry
                        .upsert_available(address, protocol_version, platform, Instant::now())
                        .await;
                } else {
                    registry.remove(address).await;
                }
                tracing::info!(workers = registry.len().await, "registry changed");
            }
            Message::UpdateWorkerInfo { info } => {
                registry.update_info(address, info).await;
            }
            Message::RequestWorkerList {
                protocol_version,
                platform,
                want_full_info,
            } => {
                let snapshot = registry
                    .snapshot(WorkerFilter {
                        protocol_version,
                        platform,
                    })
                    .await;
                let entries = snapshot
                    .into_iter()
                    .map(|r| {
                        if want_full_info {
                            WorkerListEntry::Full(r.address, r.info.unwrap_or_default())
                        } else {
                            WorkerListEntry::AddressOnly(r.address)
                        }
                    })
                    .collect();
                let reply = Message::WorkerList { entries };
                if let Some(pool) = pool {
                    if let Err(e) = pool.send(addr, &reply).await {
                        tracing::warn!(peer = %addr, error = %e, "failed to send WorkerList reply");
                    }
                }
                let evicted = registry.sweep(Instant::now()).await;
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "swept timed-out workers while answering a request");
                }
            }
            Message::Reserved { msg_type, .. } => {
                tracing::trace!(peer = %addr, ?msg_type, "ignoring reserved message type");
            }
            Message::WorkerList { .. } => {
                tracing::trace!(peer = %addr, "ignoring unsolicited WorkerList from a peer");
            }
        }
    }
}

impl Handler for Dispatch {
    fn on_connected(&self, addr: SocketAddr) {
        tracing::debug!(peer = %addr, "worker connected");
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.queues.lock().unwrap().insert(addr, tx);

        let registry = Arc::clone(&self.registry);
        let pool_slot = self.pool.get().cloned();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                Dispatch::process(&registry, pool_slot.as_ref(), addr, msg).await;
            }
        });
    }

    fn on_disconnected(&self, addr: SocketAddr) {
        tracing::debug!(peer = %addr, "worker disconnected");
        self.queues.lock().unwrap().remove(&addr);
    }

    fn on_receive(&self, addr: SocketAddr, msg: Message) {
        if let Some(tx) = self.queues.lock().unwrap().get(&addr) {
            let _ = tx.send(msg);
        }
    }
}

fn socket_addr_to_address(addr: SocketAddr) -> Address {
    match addr {
        SocketAddr::V4(v4) => Address::from_ipv4(*v4.ip()),
        SocketAddr::V6(_) => Address(0),
    }
}

/// The coordinator: an in-memory worker registry plus the connection pool that
/// feeds it.
pub struct CoordinatorService {
    registry: Arc<WorkerRegistry>,
    dispatch: Arc<Dispatch>,
}

impl CoordinatorService {
    pub fn new() -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let dispatch = Arc::new(Dispatch {
            registry: Arc::clone(&registry),
            pool: OnceLock::new(),
            queues: Mutex::new(HashMap::new()),
        });
        Self { registry, dispatch }
    }

    /// Bind [`COORDINATOR_PORT`] and run the tick/sweep loop forever. Returns
    /// `Err` only on bind failure; callers translate that into
    /// [`EXIT_CODE_BIND_FAILED`].
    pub async fn run(self) -> Result<()> {
        let pool = ConnectionPool::new(Arc::clone(&self.dispatch));
        pool.listen(COORDINATOR_PORT).await?;
        let _ = self.dispatch.pool.set(Arc::clone(&pool));
        tracing::info!(port = COORDINATOR_PORT, "coordinator listening");

        let mut ticks = interval(TICK_INTERVAL);
        let mut since_last_sweep = Duration::ZERO;
        loop {
            ticks.tick().await;
            since_last_sweep += TICK_INTERVAL;
            if since_last_sweep >= SWEEP_INTERVAL {
                since_last_sweep = Duration::ZERO;
                let evicted = self.registry.sweep(Instant::now()).await;
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "swept timed-out workers");
                }
            }
        }
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        Arc::clone(&self.registry)
    }
}

impl Default for CoordinatorService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn register_then_list_round_trip_over_loopback() {
        let coordinator = CoordinatorService::new();
        let registry = coordinator.registry();

        let pool = ConnectionPool::new(Arc::clone(&coordinator.dispatch));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        pool.listen(port).await.unwrap();
        let _ = coordinator.dispatch.pool.set(Arc::clone(&pool));

        let client_handler = Arc::new(NullHandler);
        let client_pool = ConnectionPool::new(client_handler);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        client_pool.connect(addr, StdDuration::from_secs(2)).await.unwrap();

        client_pool
            .send(
                addr,
                &Message::SetWorkerStatus {
                    is_available: true,
                    protocol_version: 42,
                    platform: 1,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let snap = registry
            .snapshot(WorkerFilter {
                protocol_version: 42,
                platform: 1,
            })
            .await;
        assert_eq!(snap.len(), 1);
    }

    struct NullHandler;
    impl Handler for NullHandler {
        fn on_connected(&self, _addr: SocketAddr) {}
        fn on_disconnected(&self, _addr: SocketAddr) {}
        fn on_receive(&self, _addr: SocketAddr, _msg: Message) {}
    }

    /// `SetWorkerStatus(true)` immediately followed by `UpdateWorkerInfo` on the
    /// same connection must be applied in that order, even though each message is
    /// handled by its own spawned work — otherwise the info update can race ahead
    /// of the status update and be silently dropped by `update_info`.
    #[tokio::test]
    async fn info_sent_right_after_status_is_not_dropped() {
        let coordinator = CoordinatorService::new();
        let registry = coordinator.registry();

        let pool = ConnectionPool::new(Arc::clone(&coordinator.dispatch));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        pool.listen(port).await.unwrap();
        let _ = coordinator.dispatch.pool.set(Arc::clone(&pool));

        let client_handler = Arc::new(NullHandler);
        let client_pool = ConnectionPool::new(client_handler);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        client_pool.connect(addr, StdDuration::from_secs(2)).await.unwrap();

        client_pool
            .send(
                addr,
                &Message::SetWorkerStatus {
                    is_available: true,
                    protocol_version: 42,
                    platform: 1,
                },
            )
            .await
            .unwrap();
        client_pool
            .send(
                addr,
                &Message::UpdateWorkerInfo {
                    info: crate::net::message::WorkerInfoFields {
                        hostname: "worker-a".into(),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        let snap = registry
            .snapshot(WorkerFilter {
                protocol_version: 42,
                platform: 1,
            })
            .await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].info.as_ref().map(|i| i.hostname.as_str()), Some("worker-a"));
    }

    #[tokio::test]
    async fn request_worker_list_also_sweeps_timed_out_workers() {
        let coordinator = CoordinatorService::new();
        let registry = coordinator.registry();
        let stale = Address::from_ipv4("10.0.0.9".parse().unwrap());
        registry
            .upsert_available(stale, 42, 1, Instant::now() - crate::registry::WORKER_TIMEOUT - Duration::from_secs(1))
            .await;
        assert_eq!(registry.len().await, 1);

        let pool = ConnectionPool::new(Arc::clone(&coordinator.dispatch));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        pool.listen(port).await.unwrap();
        let _ = coordinator.dispatch.pool.set(Arc::clone(&pool));

        let client_handler = Arc::new(NullHandler);
        let client_pool = ConnectionPool::new(client_handler);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        client_pool.connect(addr, StdDuration::from_secs(2)).await.unwrap();
        client_pool
            .send(
                addr,
                &Message::RequestWorkerList {
                    protocol_version: 7,
                    platform: 0,
                    want_full_info: false,
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert_eq!(registry.len().await, 0);
    }

    #[test]
    fn socket_addr_conversion_preserves_ipv4_octets() {
        let addr: SocketAddr = "10.1.2.3:9000".parse().unwrap();
        let a = socket_addr_to_address(addr);
        assert_eq!(a.to_dotted_quad(), "10.1.2.3");
    }
}
