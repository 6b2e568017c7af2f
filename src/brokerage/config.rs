//! Brokerage configuration resolution. A pure function of environment
//! variables and CLI flags, so the precedence rule is testable without
//! touching the real environment.

use std::path::PathBuf;

use crate::coordinator::COORDINATOR_PORT;

/// CLI flags relevant to brokerage/discovery. Parsed with `clap` by the
/// binaries; plain data here so `resolve` stays environment-agnostic.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct BrokerageArgs {
    /// Coordinator address, `host` or `host:port`.
    #[arg(long = "coordinator")]
    pub coordinator: Option<String>,

    /// Semicolon-separated brokerage root directories.
    #[arg(long = "brokerage")]
    pub brokerage: Option<String>,

    /// Use the local hostname instead of the dotted-quad IPv4 as the rendezvous
    /// file name.
    #[arg(long = "preferHostName")]
    pub prefer_host_name: bool,
}

/// The resolved discovery strategy, in order of precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// `FASTBUILD_WORKERS`: a fixed list, client-only, no network or disk I/O.
    Static(Vec<String>),
    /// `-coordinator`/`FASTBUILD_COORDINATOR`: talk to a central registry.
    Coordinator { host: String, port: u16 },
    /// `-brokerage`/`FASTBUILD_BROKERAGE_PATH`: shared-filesystem rendezvous.
    Filesystem { roots: Vec<PathBuf> },
    /// Nothing configured; discovery returns empty after a one-shot warning.
    Unconfigured,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerageConfig {
    pub mode: Mode,
    pub prefer_hostname: bool,
}

/// Resolve the discovery strategy: static list, then coordinator, then
/// filesystem roots, then unconfigured.
///
/// `get_env` abstracts `std::env::var` so this stays a pure function of its
/// inputs; production callers pass `|k| std::env::var(k).ok()`.
pub fn resolve<F>(get_env: F, args: &BrokerageArgs) -> BrokerageConfig
where
    F: Fn(&str) -> Option<String>,
{
    let prefer_hostname = args.prefer_host_name;

    if let Some(workers) = get_env("FASTBUILD_WORKERS") {
        let list = split_semicolon(&workers);
        return BrokerageConfig {
            mode: Mode::Static(list),
            prefer_hostname,
        };
    }

    let coordinator = args.coordinator.clone().or_else(|| get_env("FASTBUILD_COORDINATOR"));
    if let Some(addr) = coordinator {
        let (host, port) = parse_host_port(&addr);
        return BrokerageConfig {
            mode: Mode::Coordinator { host, port },
            prefer_hostname,
        };
    }

    let brokerage_path = args.brokerage.clone().or_else(|| get_env("FASTBUILD_BROKERAGE_PATH"));
    if let Some(path) = brokerage_path {
        let roots = split_semicolon(&path).into_iter().map(PathBuf::from).collect();
        return BrokerageConfig {
            mode: Mode::Filesystem { roots },
            prefer_hostname,
        };
    }

    BrokerageConfig {
        mode: Mode::Unconfigured,
        prefer_hostname,
    }
}

fn split_semicolon(s: &str) -> Vec<String> {
    s.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_host_port(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            Err(_) => (addr.to_string(), COORDINATOR_PORT),
        },
        _ => (addr.to_string(), COORDINATOR_PORT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn static_list_wins_over_everything() {
        let args = BrokerageArgs {
            coordinator: Some("coord.example".into()),
            brokerage: Some("/srv/fb".into()),
            prefer_host_name: false,
        };
        let env = |k: &str| match k {
            "FASTBUILD_WORKERS" => Some("1.2.3.4;5.6.7.8".to_string()),
            _ => None,
        };
        let cfg = resolve(env, &args);
        assert_eq!(
            cfg.mode,
            Mode::Static(vec!["1.2.3.4".into(), "5.6.7.8".into()])
        );
    }

    #[test]
    fn coordinator_flag_wins_over_env_and_filesystem() {
        let args = BrokerageArgs {
            coordinator: Some("coord.example:9001".into()),
            brokerage: Some("/srv/fb".into()),
            prefer_host_name: false,
        };
        let cfg = resolve(no_env, &args);
        assert_eq!(
            cfg.mode,
            Mode::Coordinator {
                host: "coord.example".into(),
                port: 9001
            }
        );
    }

    #[test]
    fn coordinator_without_port_uses_default_port() {
        let args = BrokerageArgs {
            coordinator: Some("coord.example".into()),
            ..Default::default()
        };
        let cfg = resolve(no_env, &args);
        assert_eq!(
            cfg.mode,
            Mode::Coordinator {
                host: "coord.example".into(),
                port: COORDINATOR_PORT
            }
        );
    }

    #[test]
    fn coordinator_env_var_used_when_flag_absent() {
        let args = BrokerageArgs::default();
        let env = |k: &str| (k == "FASTBUILD_COORDINATOR").then(|| "10.0.0.1:31264".to_string());
        let cfg = resolve(env, &args);
        assert_eq!(
            cfg.mode,
            Mode::Coordinator {
                host: "10.0.0.1".into(),
                port: 31264
            }
        );
    }

    #[test]
    fn filesystem_mode_splits_and_trims_roots() {
        let args = BrokerageArgs {
            brokerage: Some(" /srv/fb ; /mnt/fb2".into()),
            ..Default::default()
        };
        let cfg = resolve(no_env, &args);
        assert_eq!(
            cfg.mode,
            Mode::Filesystem {
                roots: vec![PathBuf::from("/srv/fb"), PathBuf::from("/mnt/fb2")]
            }
        );
    }

    #[test]
    fn nothing_configured_is_unconfigured() {
        let cfg = resolve(no_env, &BrokerageArgs::default());
        assert_eq!(cfg.mode, Mode::Unconfigured);
    }
}
