//! Brokerage client: `find_workers()` — the discovery entry point used by
//! both workers (to find peers) and build clients (to find compile workers).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::brokerage::config::{BrokerageConfig, Mode};
use crate::brokerage::rendezvous;
use crate::net::message::{Message, WorkerListEntry};
use crate::net::pool::{ConnectionPool, Handler};

/// Bound on the coordinator connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on the `RequestWorkerList` round trip once connected. Rather than
/// spinning forever, the wait is tied to connection liveness — it ends early
/// if the peer disconnects, and is capped here so a silently-wedged
/// coordinator can't hang the caller indefinitely.
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// A single in-flight `RequestWorkerList`, resolved exactly once: either with the
/// `WorkerList` reply, or with nothing if the connection drops first. `oneshot`
/// itself guarantees the one-request-one-reply rendezvous.
struct ClientDispatch {
    pending: Mutex<HashMap<SocketAddr, oneshot::Sender<Vec<WorkerListEntry>>>>,
}

impl Handler for ClientDispatch {
    fn on_connected(&self, _addr: SocketAddr) {}

    fn on_disconnected(&self, addr: SocketAddr) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&addr) {
            let _ = tx.send(Vec::new());
        }
    }

    fn on_receive(&self, addr: SocketAddr, msg: Message) {
        if let Message::WorkerList { entries } = msg {
            if let Some(tx) = self.pending.lock().unwrap().remove(&addr) {
                let _ = tx.send(entries);
            }
        }
    }
}

/// `find_workers`: returns worker address/hostname strings per the active
/// [`Mode`], always filtered to exclude the caller's own addresses.
pub async fn find_workers(config: &BrokerageConfig, protocol_version: u32, platform: u8) -> Vec<String> {
    let raw = match &config.mode {
        Mode::Static(list) => return list.clone(),
        Mode::Coordinator { host, port } => {
            find_via_coordinator(host, *port, protocol_version, platform).await
        }
        Mode::Filesystem { roots } => find_via_filesystem(roots, protocol_version).await,
        Mode::Unconfigured => {
            tracing::warn!("no brokerage configured; find_workers returning empty");
            Vec::new()
        }
    };

    let locals = local_ipv4_addresses();
    let our_hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();

    raw.into_iter()
        .filter(|candidate| !is_local(candidate, &locals, &our_hostname))
        .collect()
}

fn is_local(candidate: &str, locals: &[Ipv4Addr], our_hostname: &str) -> bool {
    if candidate == "127.0.0.1" {
        return true;
    }
    if let Ok(ip) = candidate.parse::<Ipv4Addr>() {
        if locals.contains(&ip) {
            return true;
        }
    }
    !our_hostname.is_empty() && candidate.eq_ignore_ascii_case(our_hostname)
}

fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    local_ip_address::list_afinet_netifas()
        .map(|ifaces| {
            ifaces
                .into_iter()
                .filter_map(|(_name, addr)| match addr {
                    std::net::IpAddr::V4(v4) => Some(v4),
                    std::net::IpAddr::V6(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn find_via_coordinator(host: &str, port: u16, protocol_version: u32, platform: u8) -> Vec<String> {
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host, port)).await {
        Ok(it) => it.collect(),
        Err(e) => {
            tracing::warn!(%host, error = %e, "failed to resolve coordinator address");
            return Vec::new();
        }
    };
    let Some(addr) = addrs.into_iter().next() else {
        tracing::warn!(%host, "coordinator address resolved to nothing");
        return Vec::new();
    };

    let dispatch = Arc::new(ClientDispatch {
        pending: Mutex::new(HashMap::new()),
    });
    let pool = ConnectionPool::new(Arc::clone(&dispatch));

    if let Err(e) = pool.connect(addr, CONNECT_TIMEOUT).await {
        tracing::warn!(%addr, error = %e, "failed to connect to coordinator");
        return Vec::new();
    }

    let (tx, rx) = oneshot::channel();
    dispatch.pending.lock().unwrap().insert(addr, tx);

    let request = Message::RequestWorkerList {
        protocol_version,
        platform,
        want_full_info: false,
    };
    if let Err(e) = pool.send(addr, &request).await {
        tracing::warn!(%addr, error = %e, "failed to send RequestWorkerList");
        pool.disconnect(addr).await;
        return Vec::new();
    }

    let result = tokio::time::timeout(REPLY_TIMEOUT, rx).await;
    pool.disconnect(addr).await;

    let entries = match result {
        Ok(Ok(entries)) => entries,
        Ok(Err(_)) | Err(_) => {
            tracing::warn!(%addr, "RequestWorkerList timed out or the connection dropped");
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .map(|e| match e {
            WorkerListEntry::AddressOnly(addr) => addr.to_dotted_quad(),
            WorkerListEntry::Full(addr, _) => addr.to_dotted_quad(),
        })
        .collect()
}

async fn find_via_filesystem(roots: &[std::path::PathBuf], protocol_version: u32) -> Vec<String> {
    let mut found = Vec::new();
    for root in roots {
        let dir = rendezvous::versioned_dir(root, protocol_version);
        match rendezvous::list_entries(&dir).await {
            Ok(entries) => found.extend(entries),
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "brokerage root unavailable");
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokerage::rendezvous::{RendezvousRecord, WorkerMode};

    #[test]
    fn is_local_matches_loopback_and_hostname() {
        let locals = vec!["10.0.0.5".parse().unwrap()];
        assert!(is_local("127.0.0.1", &locals, "host-a"));
        assert!(is_local("10.0.0.5", &locals, "host-a"));
        assert!(is_local("HOST-A", &locals, "host-a"));
        assert!(!is_local("10.0.0.9", &locals, "host-a"));
    }

    #[tokio::test]
    async fn static_mode_returns_list_verbatim_with_no_filtering() {
        let config = BrokerageConfig {
            mode: Mode::Static(vec!["1.2.3.4".into(), "127.0.0.1".into()]),
            prefer_hostname: false,
        };
        let result = find_workers(&config, 1, 0).await;
        assert_eq!(result, vec!["1.2.3.4".to_string(), "127.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn unconfigured_mode_returns_empty() {
        let config = BrokerageConfig {
            mode: Mode::Unconfigured,
            prefer_hostname: false,
        };
        assert!(find_workers(&config, 1, 0).await.is_empty());
    }

    #[tokio::test]
    async fn filesystem_mode_lists_rendezvous_entries() {
        let root = std::env::temp_dir().join(format!("brokerage-client-test-{}", std::process::id()));
        let dir = rendezvous::versioned_dir(&root, 7);
        let record = RendezvousRecord {
            version: "1.0".into(),
            user: "alice".into(),
            hostname: "worker-a".into(),
            domainname: "corp.local".into(),
            fqdn: "worker-a.corp.local".into(),
            ipv4_address: "10.0.0.9".into(),
            cpus_used: 0,
            cpus_total: 4,
            memory_mib: 8192,
            mode: WorkerMode::Dedicated,
        };
        rendezvous::write_record(&dir, "worker-a", &record).await.unwrap();

        let found = find_via_filesystem(&[root.clone()], 7).await;
        assert_eq!(found, vec!["worker-a".to_string()]);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
