//! Filesystem rendezvous: the shared-directory discovery mechanism used when
//! no coordinator is configured. A worker's liveness is announced by
//! the existence and mtime of one file; a client discovers workers by listing
//! the directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{BrokerError, Result};

/// Files older than this are considered dead and collected by [`gc_sweep`].
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// How often a worker runs [`gc_sweep`] against its write root.
pub const GC_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// How often `set_availability` is allowed to touch/rewrite the rendezvous file.
pub const AVAILABILITY_TICK: Duration = Duration::from_secs(10);

/// `<root>/main/<protocol_version>.<os>` — the directory one protocol version's
/// workers rendezvous in. `<os>` matches the three platforms the original names;
/// anything else is passed through as `std::env::consts::OS` so the path is still
/// well-formed.
pub fn versioned_dir(root: &Path, protocol_version: u32) -> PathBuf {
    root.join("main").join(format!("{protocol_version}.{}", os_name()))
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "osx",
        "windows" => "windows",
        _ => "linux",
    }
}

/// Worker availability mode, the last key/value line of a rendezvous file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Disabled,
    Idle { percent: u8 },
    Dedicated,
    Proportional,
}

impl WorkerMode {
    fn render(self) -> String {
        match self {
            Self::Disabled => "disabled".to_string(),
            Self::Idle { percent } => format!("idle @ {percent}%"),
            Self::Dedicated => "dedicated".to_string(),
            Self::Proportional => "proportional".to_string(),
        }
    }

    fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "disabled" {
            return Ok(Self::Disabled);
        }
        if s == "dedicated" {
            return Ok(Self::Dedicated);
        }
        if s == "proportional" {
            return Ok(Self::Proportional);
        }
        if let Some(rest) = s.strip_prefix("idle @ ").and_then(|r| r.strip_suffix('%')) {
            if let Ok(percent) = rest.parse::<u8>() {
                return Ok(Self::Idle { percent });
            }
        }
        Err(BrokerError::CorruptFrame {
            peer: None,
            reason: format!("unrecognized worker mode {s:?}"),
        })
    }
}

/// The human-readable key/value content of one rendezvous file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousRecord {
    pub version: String,
    pub user: String,
    pub hostname: String,
    pub domainname: String,
    pub fqdn: String,
    pub ipv4_address: String,
    pub cpus_used: u32,
    pub cpus_total: u32,
    pub memory_mib: u32,
    pub mode: WorkerMode,
}

impl RendezvousRecord {
    pub fn render(&self) -> String {
        format!(
            "Version: {}\nUser: {}\nHost Name: {}\nDomain Name: {}\nFQDN: {}\nIPv4 Address: {}\nCPUs: {}/{}\nMemory: {} MiB\nMode: {}\n",
            self.version,
            self.user,
            self.hostname,
            self.domainname,
            self.fqdn,
            self.ipv4_address,
            self.cpus_used,
            self.cpus_total,
            self.memory_mib,
            self.mode.render(),
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let bad = |reason: &str| BrokerError::CorruptFrame {
            peer: None,
            reason: reason.to_string(),
        };
        let mut version = None;
        let mut user = None;
        let mut hostname = None;
        let mut domainname = None;
        let mut fqdn = None;
        let mut ipv4_address = None;
        let mut cpus_used = None;
        let mut cpus_total = None;
        let mut memory_mib = None;
        let mut mode = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Version" => version = Some(value.to_string()),
                "User" => user = Some(value.to_string()),
                "Host Name" => hostname = Some(value.to_string()),
                "Domain Name" => domainname = Some(value.to_string()),
                "FQDN" => fqdn = Some(value.to_string()),
                "IPv4 Address" => ipv4_address = Some(value.to_string()),
                "CPUs" => {
                    let (used, total) = value
                        .split_once('/')
                        .ok_or_else(|| bad("malformed CPUs line"))?;
                    cpus_used = Some(used.parse().map_err(|_| bad("malformed CPUs used"))?);
                    cpus_total = Some(total.parse().map_err(|_| bad("malformed CPUs total"))?);
                }
                "Memory" => {
                    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
                    memory_mib = Some(digits.parse().map_err(|_| bad("malformed Memory line"))?);
                }
                "Mode" => mode = Some(WorkerMode::parse(value)?),
                _ => {}
            }
        }

        Ok(Self {
            version: version.ok_or_else(|| bad("missing Version"))?,
            user: user.ok_or_else(|| bad("missing User"))?,
            hostname: hostname.ok_or_else(|| bad("missing Host Name"))?,
            domainname: domainname.ok_or_else(|| bad("missing Domain Name"))?,
            fqdn: fqdn.ok_or_else(|| bad("missing FQDN"))?,
            ipv4_address: ipv4_address.ok_or_else(|| bad("missing IPv4 Address"))?,
            cpus_used: cpus_used.ok_or_else(|| bad("missing CPUs"))?,
            cpus_total: cpus_total.ok_or_else(|| bad("missing CPUs"))?,
            memory_mib: memory_mib.ok_or_else(|| bad("missing Memory"))?,
            mode: mode.ok_or_else(|| bad("missing Mode"))?,
        })
    }
}

fn fs_unavailable(path: &Path) -> impl Fn(std::io::Error) -> BrokerError + '_ {
    move |source| BrokerError::FilesystemUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

/// Create `dir` if necessary and write `record` to `dir/name`, replacing any
/// existing file atomically (write to a temp file, then rename).
pub async fn write_record(dir: &Path, name: &str, record: &RendezvousRecord) -> Result<()> {
    tokio::fs::create_dir_all(dir).await.map_err(fs_unavailable(dir))?;
    let final_path = dir.join(name);
    let tmp_path = dir.join(format!(".{name}.tmp"));
    tokio::fs::write(&tmp_path, record.render())
        .await
        .map_err(fs_unavailable(&tmp_path))?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(fs_unavailable(&final_path))?;
    Ok(())
}

/// Update just the mtime of an existing rendezvous file. Returns `Ok(false)` if
/// the file doesn't exist (caller should fall through to [`write_record`]).
pub async fn touch(path: &Path) -> Result<bool> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(fs_unavailable(&path)(e)),
        };
        file.set_modified(SystemTime::now()).map_err(fs_unavailable(&path))?;
        Ok(true)
    })
    .await
    .expect("touch blocking task panicked")
}

/// Best-effort delete; a missing file is not an error.
pub async fn delete(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(fs_unavailable(path)(e)),
    }
}

/// Non-recursive listing of `dir`'s entry names, the candidate worker
/// addresses/hostnames for brokerage client discovery.
pub async fn list_entries(dir: &Path) -> Result<Vec<String>> {
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(fs_unavailable(dir))?;
    let mut names = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(fs_unavailable(dir))? {
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

/// Delete every entry in `dir` whose mtime is older than [`STALE_AFTER`] relative
/// to `now`. Returns the names removed.
pub async fn gc_sweep(dir: &Path, now: SystemTime) -> Result<Vec<String>> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(fs_unavailable(dir)(e)),
    };
    let mut removed = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(fs_unavailable(dir))? {
        let metadata = match entry.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= STALE_AFTER {
            let path = entry.path();
            if tokio::fs::remove_file(&path).await.is_ok() {
                if let Some(name) = entry.file_name().to_str() {
                    removed.push(name.to_string());
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> RendezvousRecord {
        RendezvousRecord {
            version: "1.0".into(),
            user: "alice".into(),
            hostname: "host-a".into(),
            domainname: "corp.local".into(),
            fqdn: "host-a.corp.local".into(),
            ipv4_address: "10.0.0.5".into(),
            cpus_used: 2,
            cpus_total: 8,
            memory_mib: 16384,
            mode: WorkerMode::Idle { percent: 50 },
        }
    }

    #[test]
    fn render_then_parse_round_trips() {
        let record = sample_record();
        let parsed = RendezvousRecord::parse(&record.render()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn versioned_dir_layout_includes_protocol_version_and_os() {
        let dir = versioned_dir(Path::new("/srv/fb"), 42);
        let expected = format!("/srv/fb/main/42.{}", os_name());
        assert_eq!(dir, PathBuf::from(expected));
    }

    #[test]
    fn worker_mode_round_trips_each_variant() {
        for mode in [
            WorkerMode::Disabled,
            WorkerMode::Idle { percent: 75 },
            WorkerMode::Dedicated,
            WorkerMode::Proportional,
        ] {
            assert_eq!(WorkerMode::parse(&mode.render()).unwrap(), mode);
        }
    }

    #[tokio::test]
    async fn write_then_list_then_delete() {
        let dir = std::env::temp_dir().join(format!("brokerage-test-{}", std::process::id()));
        let record = sample_record();
        write_record(&dir, "worker-a", &record).await.unwrap();

        let entries = list_entries(&dir).await.unwrap();
        assert_eq!(entries, vec!["worker-a".to_string()]);

        let contents = tokio::fs::read_to_string(dir.join("worker-a")).await.unwrap();
        assert_eq!(RendezvousRecord::parse(&contents).unwrap(), record);

        delete(&dir.join("worker-a")).await.unwrap();
        assert!(list_entries(&dir).await.unwrap().is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn gc_sweep_removes_only_stale_entries() {
        let dir = std::env::temp_dir().join(format!("brokerage-gc-test-{}", std::process::id()));
        let record = sample_record();
        write_record(&dir, "fresh", &record).await.unwrap();
        write_record(&dir, "stale", &record).await.unwrap();

        let far_future = SystemTime::now() + STALE_AFTER + Duration::from_secs(60);
        let removed = gc_sweep(&dir, far_future).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(list_entries(&dir).await.unwrap().is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn touch_reports_missing_file() {
        let dir = std::env::temp_dir().join(format!("brokerage-touch-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let missing = dir.join("nobody-here");
        assert!(!touch(&missing).await.unwrap());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
