// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Datapath synchronization agent.
#[derive(Debug, Parser)]
#[command(name = "ksyncd", version, about)]
pub struct Config {
    /// Transport to the datapath (netlink, udp, tcp, unix).
    #[arg(long, env = "KSYNC_TRANSPORT", default_value = "netlink")]
    pub transport: String,

    /// Generic-netlink family id of the datapath.
    #[arg(long, env = "KSYNC_FAMILY", default_value = "24")]
    pub family: u16,

    /// Datapath address for the udp/tcp transports.
    #[arg(long, env = "KSYNC_SERVER", default_value = "127.0.0.1:20914")]
    pub server: String,

    /// Datapath socket path for the unix transport.
    #[arg(long, env = "KSYNC_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Flow shards (parallel flow registries, one send queue each).
    #[arg(long, env = "KSYNC_FLOW_SHARDS", default_value = "4")]
    pub flow_shards: usize,

    /// Flow-table slots when the datapath cannot be queried for them.
    #[arg(long, env = "KSYNC_FLOW_SLOTS", default_value = "131072")]
    pub flow_slots: usize,

    /// Stale-entry cleanup tick in milliseconds.
    #[arg(long, env = "KSYNC_STALE_INTERVAL_MS", default_value = "100")]
    pub stale_interval_ms: u64,

    /// Stale entries deleted per tick.
    #[arg(long, env = "KSYNC_STALE_PER_INTERVAL", default_value = "32")]
    pub stale_per_interval: usize,

    /// Audit: age before a HOLD slot counts as abandoned, in milliseconds.
    #[arg(long, env = "KSYNC_AUDIT_TIMEOUT_MS", default_value = "5000")]
    pub audit_timeout_ms: u64,

    /// Audit: tick period in milliseconds.
    #[arg(long, env = "KSYNC_AUDIT_INTERVAL_MS", default_value = "100")]
    pub audit_interval_ms: u64,

    /// Audit: budget for one full table pass, in seconds.
    #[arg(long, env = "KSYNC_AUDIT_SWEEP_SECS", default_value = "180")]
    pub audit_sweep_secs: u64,

    /// Audit: ceiling on slots visited per tick.
    #[arg(long, env = "KSYNC_AUDIT_YIELD_MAX", default_value = "4096")]
    pub audit_yield_max: usize,

    /// Log format (json or text).
    #[arg(long, env = "KSYNC_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "KSYNC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Which wire the agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Netlink,
    Udp,
    Tcp,
    Unix,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        let kind = self.transport_kind()?;

        if kind == TransportKind::Unix && self.socket.is_none() {
            anyhow::bail!("--socket is required with --transport unix");
        }
        if matches!(kind, TransportKind::Udp | TransportKind::Tcp) {
            self.server_addr()?;
        }
        if self.flow_shards == 0 {
            anyhow::bail!("--flow-shards must be at least 1");
        }
        if self.flow_slots == 0 {
            anyhow::bail!("--flow-slots must be at least 1");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    pub fn transport_kind(&self) -> anyhow::Result<TransportKind> {
        match self.transport.to_lowercase().as_str() {
            "netlink" => Ok(TransportKind::Netlink),
            "udp" => Ok(TransportKind::Udp),
            "tcp" => Ok(TransportKind::Tcp),
            "unix" => Ok(TransportKind::Unix),
            other => anyhow::bail!("invalid transport: {other}"),
        }
    }

    pub fn server_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        self.server
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --server {}: {e}", self.server))
    }

    pub fn stale_interval(&self) -> Duration {
        Duration::from_millis(self.stale_interval_ms)
    }

    pub fn audit_config(&self) -> crate::shmem::AuditConfig {
        crate::shmem::AuditConfig {
            timeout: Duration::from_millis(self.audit_timeout_ms),
            interval: Duration::from_millis(self.audit_interval_ms),
            sweep: Duration::from_secs(self.audit_sweep_secs),
            yield_max: self.audit_yield_max,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
