//! dagflow network simulator.
//!
//! Spins up in-memory nodes wired together over the in-process transport.
//! Node 0 starts ahead so that everyone else has to catch up through IBD;
//! afterwards blocks are mined and transactions submitted on random nodes
//! while relay keeps the network in step. Exits once every node agrees on
//! the selected tip.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use dagflow_core::constants::DEFAULT_OUTGOING_CAPACITY;
use dagflow_core::testing::{
    MemoryConsensus, MemoryMempool, block_with_parents, genesis_block, sample_transaction,
};
use dagflow_core::time::unix_now_millis;
use dagflow_core::traits::ConsensusApi;
use dagflow_core::types::Hash256;
use dagflow_p2p::memory::pipe;
use dagflow_p2p::{
    BanList, FlowConfig, FlowContext, FlowDispatcher, FlowHandlers, ShutdownController, ShutdownSignal,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Simulate a network of dagflow nodes.
#[derive(Parser, Debug)]
#[command(
    name = "dagflow-sim",
    version,
    about = "Run in-memory dagflow nodes and report whether they converge"
)]
struct Args {
    /// Number of nodes
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Blocks node 0 holds before anyone connects
    #[arg(long, default_value_t = 200)]
    preload: usize,

    /// Blocks mined on random nodes once everyone caught up
    #[arg(long, default_value_t = 50)]
    blocks: usize,

    /// Transactions submitted on random nodes while mining
    #[arg(long, default_value_t = 100)]
    transactions: usize,

    /// Pause between mining rounds, in milliseconds
    #[arg(long, default_value_t = 20)]
    interval_ms: u64,

    /// How nodes are connected
    #[arg(long, value_enum, default_value_t = Topology::Line)]
    topology: Topology,

    /// Give up on each phase after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Ban peers that break the protocol
    #[arg(long)]
    enable_banning: bool,

    /// Orphan blocks each node holds before evicting
    #[arg(long, default_value_t = 600)]
    max_orphans: usize,

    /// Minimum pause between transaction announcements, in milliseconds
    #[arg(long, default_value_t = 100)]
    tx_propagation_ms: u64,

    /// Seed for miner and transaction placement (random when omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            enable_banning: self.enable_banning,
            max_orphans: self.max_orphans,
            tx_propagation_interval: Duration::from_millis(self.tx_propagation_ms),
            ..FlowConfig::simnet()
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Topology {
    /// 0 - 1 - 2 - ... - n
    Line,
    /// A line whose ends are connected.
    Ring,
    /// Every pair connected.
    Full,
}

impl Topology {
    /// Connections as (dialer, listener) pairs.
    fn edges(self, nodes: usize) -> Vec<(usize, usize)> {
        match self {
            Topology::Line => (1..nodes).map(|i| (i - 1, i)).collect(),
            Topology::Ring => {
                let mut edges = Topology::Line.edges(nodes);
                if nodes > 2 {
                    edges.push((nodes - 1, 0));
                }
                edges
            }
            Topology::Full => (0..nodes)
                .flat_map(|i| (i + 1..nodes).map(move |j| (i, j)))
                .collect(),
        }
    }
}

struct SimNode {
    address: SocketAddr,
    consensus: Arc<MemoryConsensus>,
    mempool: Arc<MemoryMempool>,
    bans: Arc<BanList>,
    dispatcher: FlowDispatcher,
}

impl SimNode {
    fn new(index: usize, config: FlowConfig) -> anyhow::Result<Self> {
        let host = u8::try_from(index + 1).context("too many nodes")?;
        let consensus = Arc::new(MemoryConsensus::new(genesis_block()));
        let mempool = Arc::new(MemoryMempool::new());
        let bans = Arc::new(BanList::new());
        let ctx = FlowContext::new(
            config,
            consensus.clone(),
            mempool.clone(),
            bans.clone(),
            FlowHandlers::new(),
        );
        Ok(Self {
            address: SocketAddr::from(([10, 0, 0, host], 16_111)),
            consensus,
            mempool,
            bans,
            dispatcher: FlowDispatcher::new(ctx),
        })
    }

    fn ctx(&self) -> &Arc<FlowContext> {
        self.dispatcher.context()
    }

    /// Mine a block on this node's selected tip and announce it.
    fn mine(&self, nonce: u64) -> anyhow::Result<Hash256> {
        let tip = self.consensus.selected_tip();
        let parent = self.consensus.block_header(&tip)?;
        let timestamp = unix_now_millis().max(parent.timestamp + 1);
        let block = block_with_parents(&[tip], timestamp, nonce);
        let hash = block.hash();
        self.ctx().add_block(block)?;
        Ok(hash)
    }

    fn report(&self, index: usize) {
        let tip = self.consensus.selected_tip();
        info!(
            node = index,
            blocks = self.consensus.block_count(),
            tip = %hex::encode(&tip.as_bytes()[..8]),
            mempool = self.mempool.len(),
            peers = self.ctx().peer_count(),
            orphans = self.ctx().orphan_count(),
            banned = self.bans.len(),
            "node state"
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    info!("dagflow simulator v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = run(args).await {
        error!("simulation failed: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.nodes < 2 {
        bail!("need at least two nodes, got {}", args.nodes);
    }
    let timeout = Duration::from_secs(args.timeout_secs);
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let controller = Arc::new(ShutdownController::new());
    let mut interrupted = controller.subscribe();
    tokio::spawn({
        let controller = controller.clone();
        async move { controller.wait_for_signal().await }
    });

    let config = args.flow_config();
    let nodes = (0..args.nodes)
        .map(|i| SimNode::new(i, config.clone()))
        .collect::<anyhow::Result<Vec<_>>>()?;
    info!(nodes = nodes.len(), topology = ?args.topology, "starting simulation");

    let mut nonce = 0u64;
    for _ in 0..args.preload {
        nodes[0].mine(nonce)?;
        nonce += 1;
    }
    let preloaded_tip = nodes[0].consensus.selected_tip();
    info!(blocks = args.preload, tip = %preloaded_tip, "node 0 preloaded");

    let mut connections = Vec::new();
    for (dialer, listener) in args.topology.edges(nodes.len()) {
        let (outbound, inbound) = pipe(
            nodes[listener].address,
            nodes[dialer].address,
            DEFAULT_OUTGOING_CAPACITY,
        );
        connections.push(nodes[dialer].dispatcher.spawn(outbound));
        connections.push(nodes[listener].dispatcher.spawn(inbound));
    }

    let started = Instant::now();
    let caught_up = wait_until("initial block download", timeout, &mut interrupted, || {
        nodes
            .iter()
            .all(|n| n.consensus.contains(&preloaded_tip) && !n.ctx().is_ibd_running())
    })
    .await?;
    if caught_up {
        info!(elapsed = ?started.elapsed(), "every node caught up");
    }

    let interval = Duration::from_millis(args.interval_ms);
    let mut remaining_transactions = args.transactions;
    let mut tx_seed = 0u64;
    for round in 0..args.blocks {
        if interrupted.is_triggered() {
            break;
        }
        let miner = rng.gen_range(0..nodes.len());
        nodes[miner].mine(nonce)?;
        nonce += 1;

        let this_round = remaining_transactions.div_ceil(args.blocks - round);
        for _ in 0..this_round {
            let submitter = rng.gen_range(0..nodes.len());
            nodes[submitter]
                .ctx()
                .add_transaction(sample_transaction(tx_seed), false)?;
            tx_seed += 1;
        }
        remaining_transactions -= this_round;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = interrupted.wait() => break,
        }
    }

    let converged = wait_until("convergence", timeout, &mut interrupted, || {
        let first = nodes[0].consensus.selected_tip();
        nodes.iter().all(|n| n.consensus.selected_tip() == first)
    })
    .await;

    for (index, node) in nodes.iter().enumerate() {
        node.report(index);
    }

    for node in &nodes {
        node.ctx().shutdown();
    }
    for connection in connections {
        match connection.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "connection ended with an error"),
            Err(e) => warn!(error = %e, "connection task failed"),
        }
    }

    if converged? {
        info!(elapsed = ?started.elapsed(), "all nodes agree on the selected tip");
    }
    Ok(())
}

/// Poll `condition` until it holds. Returns `Ok(false)` when interrupted.
async fn wait_until(
    phase: &str,
    timeout: Duration,
    interrupted: &mut ShutdownSignal,
    mut condition: impl FnMut() -> bool,
) -> anyhow::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            bail!("{phase} did not finish within {timeout:?}");
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(25)) => {}
            _ = interrupted.wait() => {
                warn!(phase, "interrupted");
                return Ok(false);
            }
        }
    }
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_connects_neighbours() {
        assert_eq!(Topology::Line.edges(3), vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn ring_closes_the_line() {
        assert_eq!(Topology::Ring.edges(3), vec![(0, 1), (1, 2), (2, 0)]);
        assert_eq!(Topology::Ring.edges(2), vec![(0, 1)]);
    }

    #[test]
    fn full_connects_every_pair_once() {
        assert_eq!(Topology::Full.edges(4).len(), 6);
    }

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from(["dagflow-sim", "--nodes", "3", "--topology", "ring"]).unwrap();
        assert_eq!(args.nodes, 3);
        assert!(matches!(args.topology, Topology::Ring));
        assert_eq!(args.log_format, "text");
    }

    #[test]
    fn config_overrides_simnet_preset() {
        let args = Args::try_parse_from([
            "dagflow-sim",
            "--enable-banning",
            "--max-orphans",
            "10",
            "--tx-propagation-ms",
            "0",
        ])
        .unwrap();
        let config = args.flow_config();
        assert!(config.enable_banning);
        assert_eq!(config.max_orphans, 10);
        assert_eq!(config.tx_propagation_interval, Duration::ZERO);
        assert_eq!(config.ping_interval, FlowConfig::simnet().ping_interval);
    }
}
