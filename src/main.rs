//! treeway - binary-tree overlay node
//!
//! Entry point for the `treeway` binary. `run` joins a multi-process tree
//! over TCP; `simulate` runs a whole tree inside this process.

mod cli;

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{debug, info, warn};

use treeway::config::{self, TreewayConfig};
use treeway::error::{Error, Result};
use treeway::relay::RelayHandler;
use treeway::simulate::{self, SimulationOptions, SimulationReport};
use treeway::{logging, topology, version, TreeWaypoint, WaypointContext};

use crate::cli::{Cli, Commands, ConfigSubcommand};

/// How long the root waits for a round to be acknowledged
const ROUND_TIMEOUT: Duration = Duration::from_secs(30);

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    if let Err(e) = dispatch(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version { json } => {
            let build = version::build_info();
            if json {
                println!("{}", to_json(&build)?);
            } else {
                print!("{}", build);
            }
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            handle_config_command(subcommand)
        }
        Commands::Topology { nodes, rank } => print_topology(nodes, rank),
        Commands::Simulate {
            nodes,
            rounds,
            payload_bytes,
            timeout_secs,
            json,
        } => {
            logging::init_simple(simple_level(cli.verbose, cli.quiet))?;
            let options = SimulationOptions {
                nodes,
                rounds,
                payload_bytes,
                timeout: Duration::from_secs(timeout_secs),
            };
            run_simulate(&options, json)
        }
        Commands::Run {
            config,
            rank,
            rounds,
            interval_ms,
            payload_bytes,
        } => {
            let mut cfg = TreewayConfig::load(config.as_deref())?;
            if let Some(rank) = rank {
                cfg.node.rank = rank;
                cfg.validate()?;
            }

            // The guards must be kept alive for the lifetime of the program
            let _log_guards = logging::init_logging(&cfg.logging, cli.verbose, cli.quiet)?;

            let build = version::build_info();
            info!(
                version = %build.full_version(),
                target = %build.target,
                profile = %build.profile,
                "Starting treeway node"
            );

            run_node(
                cfg,
                RunOptions {
                    rounds,
                    interval: Duration::from_millis(interval_ms),
                    payload_bytes,
                },
            )
        }
    }
}

/// Level for commands that use the simple subscriber
fn simple_level(verbose: u8, quiet: bool) -> tracing::Level {
    match (quiet, verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::WARN,
        (false, 1) => tracing::Level::INFO,
        (false, 2) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| Error::Internal(format!("JSON encoding failed: {}", e)))
}

// ─────────────────────────────────────────────────────────────────
// topology
// ─────────────────────────────────────────────────────────────────

fn print_topology(nodes: usize, rank: Option<usize>) -> Result<()> {
    if nodes == 0 {
        return Err(Error::config_field_invalid("nodes", "the tree needs at least one rank"));
    }

    match rank {
        Some(rank) => {
            let view = topology::Topology::new(rank, nodes).ok_or(Error::InvalidRank {
                rank,
                world_size: nodes,
            })?;
            println!("rank:     {}", view.rank());
            if view.is_root() {
                println!("parent:   {} (root)", view.parent());
            } else {
                println!("parent:   {}", view.parent());
            }
            println!("children: {:?}", view.children());
            println!("depth:    {}", view.depth());
            println!("subtree:  {}", topology::subtree_size(rank, nodes));
        }
        None => print!("{}", topology::render(nodes)),
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// simulate
// ─────────────────────────────────────────────────────────────────

fn run_simulate(options: &SimulationOptions, json: bool) -> Result<()> {
    let report = simulate::run_simulation(options)?;

    if json {
        println!("{}", to_json(&report)?);
    } else {
        print_report(&report);
    }

    if report.is_success() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "simulation incomplete: {}/{} rounds, {}/{} deliveries, {} digest mismatches",
            report.rounds_completed,
            report.rounds,
            report.delivered,
            report.expected,
            report.digest_mismatches
        )))
    }
}

fn print_report(report: &SimulationReport) {
    println!(
        "Simulated {} ranks, {} rounds of {} bytes in {} ms",
        report.nodes, report.rounds, report.payload_bytes, report.elapsed_ms
    );
    println!(
        "Rounds completed: {}/{}  Deliveries: {}/{}  Digest mismatches: {}",
        report.rounds_completed,
        report.rounds,
        report.delivered,
        report.expected,
        report.digest_mismatches
    );
    println!();
    println!(
        "{:>6} {:>6} {:>10} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "rank", "parent", "children", "rounds", "sent", "failed", "recv", "polls"
    );
    for node in &report.per_node {
        let children = node
            .children
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:>6} {:>6} {:>10} {:>6} {:>6} {:>6} {:>6} {:>6}",
            node.rank,
            node.parent,
            if children.is_empty() { "-".to_string() } else { children },
            node.rounds_received,
            node.stats.sends_completed,
            node.stats.sends_failed,
            node.stats.receives_completed,
            node.stats.polls
        );
    }
}

// ─────────────────────────────────────────────────────────────────
// run
// ─────────────────────────────────────────────────────────────────

struct RunOptions {
    rounds: u32,
    interval: Duration,
    payload_bytes: usize,
}

/// Join the tree and relay rounds until done or interrupted
fn run_node(config: TreewayConfig, options: RunOptions) -> Result<()> {
    info!(
        rank = config.node.rank,
        world_size = config.node.world_size,
        transport = %config.transport.kind,
        "Configuration loaded"
    );

    let mut ctx = WaypointContext::init(&config)?;
    let waypoint = Arc::clone(ctx.waypoint());
    let relay = RelayHandler::attach(&waypoint);
    ctx.start_receiving();

    info!(
        rank = waypoint.id(),
        parent = waypoint.parent(),
        children = ?waypoint.children(),
        "Joined tree"
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create runtime: {}", e)))?;

    rt.block_on(async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
            _ = drive_rounds(&waypoint, &relay, &options) => {
                info!("All rounds finished");
            }
        }
    });

    let stats = waypoint.stats();
    info!(
        polls = stats.polls,
        sends_completed = stats.sends_completed,
        sends_failed = stats.sends_failed,
        receives_completed = stats.receives_completed,
        backlog_advisories = stats.backlog_advisories,
        "Final waypoint statistics"
    );

    ctx.shutdown();
    Ok(())
}

async fn drive_rounds(waypoint: &Arc<TreeWaypoint>, relay: &Arc<RelayHandler>, options: &RunOptions) {
    if waypoint.is_root() {
        broadcast_rounds(relay, options).await;
    } else {
        follow_rounds(waypoint, relay, options.rounds).await;
    }
}

/// Root: start a round, wait for the whole tree to acknowledge it, repeat
async fn broadcast_rounds(relay: &Arc<RelayHandler>, options: &RunOptions) {
    let mut round = 0u32;
    while options.rounds == 0 || round < options.rounds {
        if round > 0 {
            tokio::time::sleep(options.interval).await;
        }
        round += 1;

        let body = vec![(round % 251) as u8; options.payload_bytes];
        let started = Instant::now();
        relay.broadcast(round, &body);

        if wait_until(|| relay.is_complete(round), ROUND_TIMEOUT).await {
            info!(
                round,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Round acknowledged by the whole tree"
            );
        } else {
            warn!(round, timeout = ?ROUND_TIMEOUT, "Round not acknowledged in time");
        }
    }
}

/// Everyone else: relaying happens in the handler; just decide when to stop
async fn follow_rounds(waypoint: &Arc<TreeWaypoint>, relay: &Arc<RelayHandler>, rounds: u32) {
    if rounds == 0 {
        std::future::pending::<()>().await;
    }

    // Stay until the last round has been acknowledged upward and flushed.
    wait_until(|| relay.is_complete(rounds), Duration::MAX).await;
    wait_until(|| waypoint.stats().sends_pending() == 0, Duration::from_secs(10)).await;
    debug!(rank = waypoint.id(), rounds, "Relayed every round");
}

/// Poll `condition` until it holds or `timeout` passes
async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(5));
    loop {
        ticker.tick().await;
        if condition() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────

fn handle_config_command(subcommand: ConfigSubcommand) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = TreewayConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let created = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", created.display());
        }
        ConfigSubcommand::Validate { config } => {
            let cfg = TreewayConfig::load(config.as_deref())?;
            println!(
                "Configuration is valid (rank {} of {}, transport {}).",
                cfg.node.rank, cfg.node.world_size, cfg.transport.kind
            );
        }
    }

    Ok(())
}
