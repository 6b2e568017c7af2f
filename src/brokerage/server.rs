//! Brokerage server: `set_availability` — the worker-side registrar that
//! periodically announces liveness to a coordinator or a filesystem rendezvous
//! root, rate-limited to one real announcement per tick.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;

use crate::brokerage::config::{BrokerageConfig, Mode};
use crate::brokerage::rendezvous::{
    self, RendezvousRecord, WorkerMode, AVAILABILITY_TICK, GC_INTERVAL,
};
use crate::error::Result;
use crate::net::message::{Message, WorkerInfoFields};
use crate::net::pool::{ConnectionPool, Handler};

/// How often identity (hostname/domain/IP) is re-resolved while available.
const IDENTITY_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Unregistered,
    Registered,
}

/// The descriptive fields a worker reports about itself; everything
/// `UpdateWorkerInfo`/the rendezvous file needs beyond address/protocol/platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub version: String,
    pub user: String,
    pub mode: WorkerMode,
    pub available_cpus: u32,
    pub total_cpus: u32,
    pub memory_mib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    hostname: String,
    domainname: String,
    fqdn: String,
    ipv4_address: String,
}

fn resolve_identity() -> Identity {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let ipv4_address = local_ip_address::local_ip()
        .ok()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    Identity {
        fqdn: hostname.clone(),
        domainname: String::new(),
        hostname,
        ipv4_address,
    }
}

struct Inner {
    registration: Registration,
    last_tick: Option<Instant>,
    last_identity_refresh: Instant,
    last_gc: Instant,
    identity: Identity,
    settings: WorkerSettings,
    pushed_identity: Option<Identity>,
    pushed_settings: Option<WorkerSettings>,
    rendezvous_path: Option<PathBuf>,
}

struct NullHandler;
impl Handler for NullHandler {
    fn on_connected(&self, _addr: SocketAddr) {}
    fn on_disconnected(&self, _addr: SocketAddr) {}
    fn on_receive(&self, _addr: SocketAddr, _msg: Message) {}
}

/// Drives periodic worker availability announcements. One instance per worker
/// process; `set_availability` is meant to be called on a ~1s timer.
pub struct BrokerageServer {
    config: BrokerageConfig,
    protocol_version: u32,
    platform: u8,
    inner: Mutex<Inner>,
}

impl BrokerageServer {
    pub fn new(config: BrokerageConfig, protocol_version: u32, platform: u8, settings: WorkerSettings) -> Self {
        let now = Instant::now();
        Self {
            config,
            protocol_version,
            platform,
            inner: Mutex::new(Inner {
                registration: Registration::Unregistered,
                last_tick: None,
                last_identity_refresh: now,
                last_gc: now,
                identity: resolve_identity(),
                settings,
                pushed_identity: None,
                pushed_settings: None,
                rendezvous_path: None,
            }),
        }
    }

    /// Call roughly once a second. Internally rate-limited: side effects happen
    /// only on an availability transition or once the 10s tick has elapsed.
    pub async fn set_availability(&self, available: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let was_registered = inner.registration == Registration::Registered;
        let transitioned = available != was_registered;

        if available {
            if now.duration_since(inner.last_identity_refresh) >= IDENTITY_REFRESH_INTERVAL {
                inner.identity = resolve_identity();
                inner.last_identity_refresh = now;
            }
        }

        let tick_due = inner
            .last_tick
            .map(|t| now.duration_since(t) >= AVAILABILITY_TICK)
            .unwrap_or(true);

        if !transitioned && !tick_due {
            return Ok(());
        }
        inner.last_tick = Some(now);

        match self.config.mode.clone() {
            Mode::Coordinator { host, port } => {
                self.tick_coordinator(&mut inner, available, &host, port).await?;
            }
            Mode::Filesystem { roots } => {
                self.tick_filesystem(&mut inner, available, &roots, now).await?;
            }
            Mode::Static(_) | Mode::Unconfigured => {
                // No server-side registration target; availability is tracked
                // locally only.
                inner.registration = if available {
                    Registration::Registered
                } else {
                    Registration::Unregistered
                };
            }
        }

        Ok(())
    }

    async fn tick_coordinator(&self, inner: &mut Inner, available: bool, host: &str, port: u16) -> Result<()> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| crate::error::BrokerError::ConnectFailed {
                addr: format!("{host}:{port}"),
                source,
            })?
            .collect();
        let Some(addr) = addrs.into_iter().next() else {
            return Err(crate::error::BrokerError::NotConfigured);
        };

        let pool = ConnectionPool::new(Arc::new(NullHandler));
        pool.connect(addr, Duration::from_secs(2)).await?;

        if available {
            let identity_changed = inner.pushed_identity.as_ref() != Some(&inner.identity);
            let settings_changed = inner.pushed_settings.as_ref() != Some(&inner.settings);

            pool.send(
                addr,
                &Message::SetWorkerStatus {
                    is_available: true,
                    protocol_version: self.protocol_version,
                    platform: self.platform,
                },
            )
            .await?;

            if identity_changed || settings_changed {
                pool.send(
                    addr,
                    &Message::UpdateWorkerInfo {
                        info: WorkerInfoFields {
                            version: inner.settings.version.clone(),
                            user: inner.settings.user.clone(),
                            hostname: inner.identity.hostname.clone(),
                            domainname: inner.identity.domainname.clone(),
                            mode: render_mode(inner.settings.mode),
                            available_cpus: inner.settings.available_cpus,
                            total_cpus: inner.settings.total_cpus,
                            memory_mib: inner.settings.memory_mib,
                        },
                    },
                )
                .await?;
                inner.pushed_identity = Some(inner.identity.clone());
                inner.pushed_settings = Some(inner.settings.clone());
            }
            inner.registration = Registration::Registered;
        } else {
            pool.send(
                addr,
                &Message::SetWorkerStatus {
                    is_available: false,
                    protocol_version: self.protocol_version,
                    platform: self.platform,
                },
            )
            .await?;
            inner.registration = Registration::Unregistered;
        }

        pool.disconnect(addr).await;
        Ok(())
    }

    async fn tick_filesystem(
        &self,
        inner: &mut Inner,
        available: bool,
        roots: &[PathBuf],
        now: Instant,
    ) -> Result<()> {
        let Some(write_root) = roots.first() else {
            return Err(crate::error::BrokerError::NotConfigured);
        };
        let dir = rendezvous::versioned_dir(write_root, self.protocol_version);
        let name = if self.config.prefer_hostname {
            inner.identity.hostname.clone()
        } else {
            inner.identity.ipv4_address.clone()
        };
        let path = dir.join(&name);

        if !available {
            if let Some(old_path) = inner.rendezvous_path.take() {
                rendezvous::delete(&old_path).await?;
            } else {
                rendezvous::delete(&path).await?;
            }
            inner.registration = Registration::Unregistered;
            return Ok(());
        }

        let identity_changed = inner.pushed_identity.as_ref() != Some(&inner.identity);
        let settings_changed = inner.pushed_settings.as_ref() != Some(&inner.settings);

        if identity_changed {
            if let Some(old_path) = inner.rendezvous_path.take() {
                rendezvous::delete(&old_path).await?;
            }
        }

        if !identity_changed && !settings_changed {
            if !rendezvous::touch(&path).await? {
                self.write_rendezvous(inner, &dir, &name).await?;
            }
        } else {
            self.write_rendezvous(inner, &dir, &name).await?;
        }

        inner.registration = Registration::Registered;
        inner.rendezvous_path = Some(path);
        inner.pushed_identity = Some(inner.identity.clone());
        inner.pushed_settings = Some(inner.settings.clone());

        if now.duration_since(inner.last_gc) >= GC_INTERVAL {
            inner.last_gc = now;
            let removed = rendezvous::gc_sweep(&dir, SystemTime::now()).await?;
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "garbage-collected stale rendezvous files");
            }
        }

        Ok(())
    }

    async fn write_rendezvous(&self, inner: &Inner, dir: &std::path::Path, name: &str) -> Result<()> {
        let record = RendezvousRecord {
            version: inner.settings.version.clone(),
            user: inner.settings.user.clone(),
            hostname: inner.identity.hostname.clone(),
            domainname: inner.identity.domainname.clone(),
            fqdn: inner.identity.fqdn.clone(),
            ipv4_address: inner.identity.ipv4_address.clone(),
            cpus_used: inner.settings.available_cpus,
            cpus_total: inner.settings.total_cpus,
            memory_mib: inner.settings.memory_mib,
            mode: inner.settings.mode,
        };
        rendezvous::write_record(dir, name, &record).await
    }

    /// Best-effort delete of our rendezvous file, called on graceful shutdown if
    /// we believed ourselves available.
    pub async fn shutdown(&self) {
        let inner = self.inner.lock().await;
        if inner.registration == Registration::Registered {
            if let Some(path) = &inner.rendezvous_path {
                let _ = rendezvous::delete(path).await;
            }
        }
    }
}

fn render_mode(mode: WorkerMode) -> String {
    match mode {
        WorkerMode::Disabled => "disabled".to_string(),
        WorkerMode::Idle { percent } => format!("idle @ {percent}%"),
        WorkerMode::Dedicated => "dedicated".to_string(),
        WorkerMode::Proportional => "proportional".to_string(),
    }
}
