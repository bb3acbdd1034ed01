use clap::Parser;
use std::path::PathBuf;

use crate::scanner::DEFAULT_POLL_INTERVAL_SECS;
use crate::types::ScanKind;

pub const DEFAULT_PORT: u16 = 443;
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_DEPTH: u32 = 10;
pub const DEFAULT_CONCURRENCY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "h2recon")]
#[command(about = "Find HTTP/2 capable TLS 1.3 hosts around a target")]
pub struct Cli {
    /// Target IP, CIDR or hostname
    #[arg(long)]
    pub host: String,

    /// Target port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Per-probe timeout in seconds
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// How many neighbouring addresses to crawl around a single host
    #[arg(short, long, default_value_t = DEFAULT_DEPTH)]
    pub depth: u32,

    /// Enable TLS feasibility scanning
    #[arg(long)]
    pub tls: bool,

    /// Enable TCP connect scanning
    #[arg(long)]
    pub tcp: bool,

    /// Enable ping scanning
    #[arg(long)]
    pub ping: bool,

    /// Write completed outcomes to this file instead of stdout
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Concurrent TLS probes per task
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Seconds a worker waits for a task before re-checking for shutdown
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval: u64,

    /// Exit once every queue is drained and no worker is busy
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Requested scan kinds, in scheduling order.
    pub fn kinds(&self) -> Vec<ScanKind> {
        let mut kinds = Vec::new();
        if self.ping {
            kinds.push(ScanKind::Ping);
        }
        if self.tcp {
            kinds.push(ScanKind::Tcp);
        }
        if self.tls {
            kinds.push(ScanKind::Tls);
        }
        kinds
    }

    pub fn validate(&self) -> eyre::Result<()> {
        if self.kinds().is_empty() {
            eyre::bail!("at least one scan type (--tls, --tcp, --ping) must be enabled");
        }
        if self.timeout == 0 {
            eyre::bail!("timeout must be at least one second");
        }
        if self.poll_interval == 0 {
            eyre::bail!("poll interval must be at least one second");
        }
        Ok(())
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
