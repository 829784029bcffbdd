//! flowvane collector binary: wires the UDP collectors, the BGP annotator,
//! and the aggregation store into one pipeline and runs it until ctrl-c.

use anyhow::{Context, Result};
use clap::Parser;
use flowvane::annotate::Annotator;
use flowvane::config::Config;
use flowvane::database::FlowDatabase;
use flowvane::flow::Flow;
use flowvane::ingest::Collector;
use flowvane::rib::{RibRegistry, RibSource};
use flowvane::srcache::SamplerateCache;
use flowvane::stats::Stats;
use flowvane::templates::TemplateCache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "flowvane")]
#[command(about = "IPFIX/sFlow collector with BGP annotation", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "flowvane.yml")]
    config: PathBuf,
}

fn init_tracing(debug: u8) {
    let filter = match debug {
        0 | 1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        // tracing may not be up yet when configuration loading fails
        eprintln!("flowvane failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config).context("failed to load configuration")?;
    init_tracing(config.debug);
    tracing::info!(
        agents = config.agents.len(),
        bgp_augmentation = config.bgp_augmentation.enabled,
        "configuration loaded"
    );

    let stats = Arc::new(Stats::default());
    let templates = Arc::new(TemplateCache::new());
    let samplerates = Arc::new(SamplerateCache::new(&config.agents));
    let database = Arc::new(FlowDatabase::new(config.aggregation.bucket_seconds));

    // the enclosing routing daemon registers its RIBs here; until it does,
    // annotation degrades to pass-through
    let ribs: Arc<RibRegistry> = Arc::new(RibRegistry::new());
    let annotator = if config.bgp_augmentation.enabled {
        Some(Arc::new(Annotator::new(
            &config,
            Arc::clone(&ribs) as Arc<dyn RibSource>,
        )))
    } else {
        None
    };

    let (flow_tx, flow_rx) = mpsc::channel::<Flow>(config.aggregation.channel_depth);

    let agents = config.agent_names();
    let ipfix_collector = Collector::spawn_ipfix(
        &config.ipfix,
        agents.clone(),
        Arc::clone(&templates),
        Arc::clone(&samplerates),
        Arc::clone(&stats),
        config.bgp_augmentation.enabled,
        flow_tx.clone(),
    )
    .await?;
    let sflow_collector = Collector::spawn_sflow(
        &config.sflow,
        agents,
        Arc::clone(&samplerates),
        Arc::clone(&stats),
        flow_tx,
    )
    .await?;

    let debug = config.debug;
    let pipeline_database = Arc::clone(&database);
    let pipeline = tokio::spawn(async move {
        let mut flow_rx = flow_rx;
        while let Some(mut flow) = flow_rx.recv().await {
            if let Some(annotator) = &annotator {
                annotator.annotate_flow(&mut flow);
            }
            if debug > 2 {
                tracing::trace!(%flow, "flow stored");
            }
            pipeline_database.insert(flow);
        }
        tracing::info!("flow pipeline drained");
    });

    let shutdown = CancellationToken::new();
    let retention_shutdown = shutdown.clone();
    let retention_database = Arc::clone(&database);
    let retention_window =
        config.aggregation.bucket_seconds * config.aggregation.retention_buckets as i64;
    let retention_tick = Duration::from_secs(config.aggregation.bucket_seconds as u64);
    let retention = tokio::spawn(async move {
        let mut tick = tokio::time::interval(retention_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = retention_shutdown.cancelled() => break,
                _ = tick.tick() => {
                    let cutoff = chrono::Utc::now().timestamp() - retention_window;
                    let evicted = retention_database.evict_before(cutoff);
                    if evicted > 0 {
                        tracing::debug!(evicted, cutoff, "evicted expired flow shards");
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    tracing::info!("shutting down");
    shutdown.cancel();

    // closing the collectors drops the last flow senders, which lets the
    // pipeline drain and exit on its own
    ipfix_collector.close().await;
    sflow_collector.close().await;
    if let Err(err) = pipeline.await {
        if !err.is_cancelled() {
            tracing::error!("pipeline task join error: {err}");
        }
    }
    if let Err(err) = retention.await {
        if !err.is_cancelled() {
            tracing::error!("retention task join error: {err}");
        }
    }

    for (name, value) in stats.snapshot() {
        tracing::info!(counter = %name, value, "final counter");
    }
    tracing::info!(flows = database.flow_count(), "collector stopped");
    Ok(())
}
