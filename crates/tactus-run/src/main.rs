//! Tactus Run - executes a demo reactor program.
//!
//! Wires a small pipeline (a timer-driven producer feeding a consumer
//! over a port, plus a self-rescheduling logical action with minimum
//! spacing) and drives it on the runtime with the options given on the
//! command line.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tactus_runtime::{GraphBuilder, Runtime, RuntimeConfig, SpacingPolicy};

const MS: i64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(name = "tactus-run")]
#[command(about = "Run a demo reactor program on the tactus runtime")]
struct Cli {
    /// Number of worker threads (0 = one per core)
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Stop after this many milliseconds of logical time
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Skip waiting for physical time to catch up with logical time
    #[arg(long)]
    fast: bool,

    /// Keep running on an empty event queue, waiting for external events
    #[arg(long)]
    keepalive: bool,

    /// Write a binary execution trace to this path
    #[arg(long)]
    trace: Option<PathBuf>,
}

/// Producer-side counter state.
struct Counter {
    sent: i64,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tactus_run=info,tactus_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut g = GraphBuilder::new();
    let producer = g.add_reactor("producer", Counter { sent: 0 });
    let consumer = g.add_reactor("consumer", ());
    let tick = g.add_timer(producer, "tick", 0, 10 * MS);
    let out = g.add_port(producer, "out", 8);
    let echo = g.add_logical_action(consumer, "echo", 0, 8);
    g.set_min_spacing(echo, 25 * MS, SpacingPolicy::Defer);

    let emit = g.add_reaction(producer, "emit", move |ctx| {
        let n = ctx.with_state(|state: &mut Counter| {
            state.sent += 1;
            state.sent
        });
        ctx.set_value(out, &n.to_le_bytes()).unwrap();
    });
    g.trigger_reaction(tick, emit);
    g.reaction_writes(emit, out);

    let absorb = g.add_reaction(consumer, "absorb", move |ctx| {
        if ctx.check_deadline(true) {
            return;
        }
        let bytes = ctx.port_value(out).expect("port set at this tag");
        let n = i64::from_le_bytes(bytes.as_ref().try_into().unwrap());
        info!(n, tag = %ctx.tag(), "consumed");
        // Bounce every value onto the spaced logical action; spacing
        // defers the surplus.
        let _ = ctx.schedule_int(echo, 0, n).unwrap();
    });
    g.connect(out, absorb);
    g.set_deadline(
        absorb,
        5 * MS,
        Some(Box::new(|ctx| {
            error!(tag = %ctx.tag(), "consumer missed its deadline");
        })),
    );

    let echoed = g.add_reaction(consumer, "echoed", move |ctx| {
        let bytes = ctx.action_value(echo).expect("echo carries a value");
        let n = i64::from_le_bytes(bytes.as_ref().try_into().unwrap());
        info!(n, tag = %ctx.tag(), "echoed");
    });
    g.trigger_reaction(echo, echoed);

    let graph = match g.build() {
        Ok(graph) => graph,
        Err(e) => {
            error!("failed to build reactor graph: {e}");
            std::process::exit(1);
        }
    };

    let config = RuntimeConfig {
        timeout: Some(cli.timeout_ms as i64 * MS),
        fast: cli.fast,
        workers: if cli.workers == 0 {
            RuntimeConfig::default().workers
        } else {
            cli.workers
        },
        keepalive: cli.keepalive,
        trace_path: cli.trace,
        ..RuntimeConfig::default()
    };

    let mut runtime = Runtime::new(graph, config);
    match runtime.run() {
        Ok(report) => {
            info!(
                tags = report.tags_processed,
                reactions = report.reactions_executed,
                final_tag = %report.final_tag,
                live_tokens = report.live_tokens,
                "run complete"
            );
        }
        Err(e) => {
            error!("run failed: {e}");
            std::process::exit(1);
        }
    }
}
