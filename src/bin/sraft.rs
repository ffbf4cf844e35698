/*
 * sraft runs a single consensus node. It takes configuration via command-line
 * flags and SRAFT_-prefixed environment variables (flags win), joins the
 * cluster given by --peers, and serves the replicated log until SIGINT or
 * SIGTERM.
 */

#![warn(clippy::all)]

use serde_derive::Deserialize;
use sraft::errinput;
use sraft::error::Result;
use sraft::metrics::Metrics;
use sraft::raft;
use sraft::storage;
use sraft::Server;

use std::collections::HashMap;
use std::net::TcpListener;

fn main() -> Result<()> {
    let args = clap::command!()
        .about("A Raft server with RTT-ranked sub-leaders for fast failover")
        .args([
            clap::Arg::new("node_id")
                .long("node-id")
                .help("Node ID; inferred from the peer list when omitted"),
            clap::Arg::new("host").long("host").help("Bind host [default: 0.0.0.0]"),
            clap::Arg::new("port").long("port").help("Bind port [default: 5000]"),
            clap::Arg::new("peers")
                .long("peers")
                .help("Comma-separated host:port list of all cluster nodes, including this one"),
            clap::Arg::new("debug")
                .long("debug")
                .action(clap::ArgAction::SetTrue)
                .help("Enable debug logging"),
            clap::Arg::new("original_raft")
                .long("original-raft")
                .action(clap::ArgAction::SetTrue)
                .help("Disable the sub-leader extension and run classical Raft"),
            clap::Arg::new("metrics_file")
                .long("metrics-file")
                .help("Append metric records to this file"),
            clap::Arg::new("data_dir")
                .long("data-dir")
                .help("Log storage directory, or 'memory' for no persistence [default: data]"),
            clap::Arg::new("log_level").long("log-level").help("Log level [default: info]"),
        ])
        .get_matches();
    let cfg = Config::new(&args)?;

    let loglevel =
        if cfg.debug { simplelog::LevelFilter::Debug } else { cfg.log_level.parse()? };
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("sraft");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let opts = cfg.raft_options()?;
    let (id, peers) = cfg.cluster()?;

    let log = match cfg.data_dir.as_str() {
        "memory" | "" => raft::Log::new(Box::new(storage::Memory::new()))?,
        dir => raft::Log::new(Box::new(storage::Disk::new(
            std::path::Path::new(dir).join(format!("sraft-{id}.log")),
        )?))?,
    };
    let metrics = match &cfg.metrics_file {
        Some(path) => Metrics::file(path)?,
        None => Metrics::disabled(),
    };

    // Bind before spawning anything, so a bind failure exits non-zero without
    // touching the network further.
    let listener = TcpListener::bind((cfg.host.as_str(), cfg.port))?;

    // SIGINT/SIGTERM shut the server down gracefully with exit code 0.
    let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])?;
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            shutdown_tx.send(()).ok();
        }
    });

    Server::new(id, peers, log, Box::new(raft::NoopState::new()), opts, metrics)?
        .serve(listener, shutdown_rx)
}

/// Node configuration, from defaults, SRAFT_-prefixed environment variables,
/// and command-line flags, in increasing order of precedence.
#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    node_id: Option<raft::NodeID>,
    host: String,
    port: u16,
    peers: String,
    debug: bool,
    original_raft: bool,
    #[serde(default)]
    metrics_file: Option<String>,
    data_dir: String,
    log_level: String,

    heartbeat_interval_ms: u64,
    subleader_ratio: f64,
    primary_timeout_min_ms: u64,
    primary_timeout_max_ms: u64,
    secondary_timeout_min_ms: u64,
    secondary_timeout_max_ms: u64,
    follower_timeout_min_ms: u64,
    follower_timeout_max_ms: u64,
    rtt_ewma_alpha: f64,
    rtt_stale_ms: u64,
}

impl Config {
    fn new(args: &clap::ArgMatches) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 5000)?
            .set_default("peers", "")?
            .set_default("debug", false)?
            .set_default("original_raft", false)?
            .set_default("data_dir", "data")?
            .set_default("log_level", "info")?
            .set_default("heartbeat_interval_ms", 50)?
            .set_default("subleader_ratio", 0.4)?
            .set_default("primary_timeout_min_ms", 150)?
            .set_default("primary_timeout_max_ms", 200)?
            .set_default("secondary_timeout_min_ms", 250)?
            .set_default("secondary_timeout_max_ms", 350)?
            .set_default("follower_timeout_min_ms", 300)?
            .set_default("follower_timeout_max_ms", 1000)?
            .set_default("rtt_ewma_alpha", 0.3)?
            .set_default("rtt_stale_ms", 5000)?
            .add_source(config::Environment::with_prefix("SRAFT"));

        // Flags that were explicitly given override the environment.
        for key in ["node_id", "host", "port", "peers", "metrics_file", "data_dir", "log_level"] {
            if args.value_source(key) == Some(clap::parser::ValueSource::CommandLine) {
                builder = builder.set_override_option(key, args.get_one::<String>(key).cloned())?;
            }
        }
        for key in ["debug", "original_raft"] {
            if args.get_flag(key) {
                builder = builder.set_override(key, true)?;
            }
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Builds the consensus options, quantizing millisecond knobs to driver
    /// ticks. The timeout ladder is validated both here in milliseconds and
    /// again in ticks by the node.
    fn raft_options(&self) -> Result<raft::Options> {
        if self.primary_timeout_max_ms >= self.secondary_timeout_min_ms
            || self.secondary_timeout_min_ms >= self.follower_timeout_min_ms
        {
            return errinput!(
                "timeouts must satisfy primary.max < secondary.min < follower.min, got {}/{}/{}",
                self.primary_timeout_max_ms,
                self.secondary_timeout_min_ms,
                self.follower_timeout_min_ms
            );
        }
        let tick_ms = raft::TICK_INTERVAL.as_millis() as u64;
        let ticks = |ms: u64| -> raft::Ticks { (ms / tick_ms).clamp(1, u8::MAX as u64) as u8 };
        let opts = raft::Options {
            heartbeat_interval: ticks(self.heartbeat_interval_ms),
            election_timeout_range: ticks(self.follower_timeout_min_ms)
                ..ticks(self.follower_timeout_max_ms).saturating_add(1),
            primary_timeout_range: ticks(self.primary_timeout_min_ms)
                ..ticks(self.primary_timeout_max_ms).saturating_add(1),
            secondary_timeout_range: ticks(self.secondary_timeout_min_ms)
                ..ticks(self.secondary_timeout_max_ms).saturating_add(1),
            enable_subleader: !self.original_raft,
            subleader_ratio: self.subleader_ratio,
            rtt_alpha: self.rtt_ewma_alpha,
            rtt_stale: std::time::Duration::from_millis(self.rtt_stale_ms),
            ..raft::Options::default()
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Resolves the cluster layout: node IDs are assigned 1..=N over the
    /// sorted peer list. Our own ID is either given or inferred by finding
    /// our host:port in the list. Returns our ID and the other peers.
    fn cluster(&self) -> Result<(raft::NodeID, HashMap<raft::NodeID, String>)> {
        let mut addrs: Vec<String> =
            self.peers.split(',').map(|addr| addr.trim().to_string()).filter(|a| !a.is_empty()).collect();
        if addrs.is_empty() {
            return errinput!("a peer list is required (--peers or SRAFT_PEERS)");
        }
        addrs.sort();
        addrs.dedup();
        if addrs.len() > raft::NodeID::MAX as usize {
            return errinput!("too many peers ({})", addrs.len());
        }
        for addr in &addrs {
            let Some((host, port)) = addr.rsplit_once(':') else {
                return errinput!("malformed peer address {addr}");
            };
            if host.is_empty() {
                return errinput!("malformed peer address {addr}");
            }
            port.parse::<u16>()?;
        }

        let id = match self.node_id {
            Some(id) => {
                if id == 0 || id as usize > addrs.len() {
                    return errinput!("node ID {id} not in peer list of {} nodes", addrs.len());
                }
                id
            }
            None => {
                let own = format!("{}:{}", self.host, self.port);
                match addrs.iter().position(|addr| *addr == own) {
                    Some(position) => (position + 1) as raft::NodeID,
                    None => {
                        return errinput!(
                            "can't infer node ID: {own} is not in the peer list; pass --node-id"
                        )
                    }
                }
            }
        };

        let peers = addrs
            .into_iter()
            .enumerate()
            .map(|(position, addr)| ((position + 1) as raft::NodeID, addr))
            .filter(|(peer, _)| *peer != id)
            .collect();
        Ok((id, peers))
    }
}
