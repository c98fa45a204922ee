//! ae-pipeline - relay pipeline for autonomous experiments
//!
//! One binary, one command per deployable unit: the broker hosting the
//! channel and the feedback store, the two relays, and a simulated scan.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use ae_pipeline::broker::Broker;
use ae_pipeline::channel::{follow, MessageChannel, TcpChannel, TopicPattern};
use ae_pipeline::cli::{Cli, Command};
use ae_pipeline::config::PipelineConfig;
use ae_pipeline::control::{AdaptivePlan, ControlAdapter, StatusBoard};
use ae_pipeline::logging;
use ae_pipeline::recommend::RecommenderRegistry;
use ae_pipeline::reduce::ReducerRegistry;
use ae_pipeline::relay::{AdaptiveRelay, AnalysisRelay};
use ae_pipeline::store::RemoteFeedbackStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    logging::init_from_config(&config.application)?;

    info!(app = %config.application.name, command = ?cli.command, "ae-pipeline starting");

    match cli.command {
        Command::Broker { listen } => run_broker(&config, listen).await,
        Command::Analysis => run_analysis(&config).await,
        Command::Adaptive => run_adaptive(&config).await,
        Command::Scan { run_id, max_batches } => run_scan(&config, run_id, max_batches).await,
        Command::Echo { pattern } => run_echo(&config, &pattern).await,
    }
}

async fn run_broker(config: &PipelineConfig, listen: Option<String>) -> Result<()> {
    let address = listen.unwrap_or_else(|| config.broker.address.clone());
    let handle = Broker::from_config(&config.broker)
        .bind(&address)
        .await
        .with_context(|| format!("Failed to bind broker on {}", address))?;
    info!(address = %handle.local_addr(), "Broker ready");

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping broker");
    handle.shutdown().await?;
    Ok(())
}

async fn run_analysis(config: &PipelineConfig) -> Result<()> {
    let reducer = ReducerRegistry::new()
        .from_config(&config.analysis)
        .with_context(|| format!("Failed to build reducer '{}'", config.analysis.name))?;
    let channel = Arc::new(TcpChannel::from_config(&config.broker));
    let relay = AnalysisRelay::new(channel, reducer, config).spawn();

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping analysis relay");
    relay.shutdown().await?;
    Ok(())
}

async fn run_adaptive(config: &PipelineConfig) -> Result<()> {
    let recommender = RecommenderRegistry::new()
        .from_config(&config.adaptive)
        .with_context(|| format!("Failed to build recommender '{}'", config.adaptive.name))?;
    let channel = Arc::new(TcpChannel::from_config(&config.broker));
    let store = Arc::new(RemoteFeedbackStore::from_config(&config.broker));
    if let Err(e) = store.ping().await {
        warn!(error = %e, "Feedback store not reachable yet; recommendations will fail until it is");
    }
    let relay = AdaptiveRelay::new(channel, store, recommender, config).spawn();

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping adaptive relay");
    relay.shutdown().await?;
    Ok(())
}

async fn run_scan(config: &PipelineConfig, run_id: Option<String>, max_batches: Option<u32>) -> Result<()> {
    let mut control = config.require_control()?.clone();
    if max_batches.is_some() {
        control.max_batches = max_batches;
    }

    let channel: Arc<dyn MessageChannel> = Arc::new(TcpChannel::from_config(&config.broker));
    let store = Arc::new(RemoteFeedbackStore::from_config(&config.broker));
    let mut adapter = ControlAdapter::from_config(channel.clone(), store, config);

    let mut status_watch = None;
    if let Some(topic) = &config.topics.status {
        let board = StatusBoard::new();
        status_watch = Some(board.watch(channel.clone(), topic, config.reconnect.clone()));
        adapter = adapter.with_status_board(board);
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut plan = AdaptivePlan::new(Arc::new(adapter), control).with_cancel(cancel_rx);
    if let Some(run_id) = &run_id {
        plan = plan.with_run_id(run_id);
    }
    let mut detector = config.simulation.clone();

    let outcome = {
        let run = plan.run(&mut detector);
        tokio::pin!(run);
        loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, cancelling plan");
                    let _ = cancel_tx.send(true);
                }
            }
        }
    };

    if let Some(status) = status_watch {
        status.shutdown().await?;
    }
    let summary = outcome?;
    info!(
        run_id = %summary.run_id,
        batches = summary.batches,
        reused = summary.reused,
        last_point = ?summary.last_point,
        end = ?summary.end,
        "Scan finished"
    );
    Ok(())
}

async fn run_echo(config: &PipelineConfig, pattern: &str) -> Result<()> {
    let channel = TcpChannel::from_config(&config.broker);
    let pattern = TopicPattern::from(pattern);
    info!(%pattern, address = %channel.address(), "Echoing messages");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    follow(&channel, &pattern, &config.reconnect, shutdown, |delivery| {
        let body = String::from_utf8_lossy(&delivery.payload);
        info!(topic = %delivery.topic, bytes = delivery.payload.len(), "{}", body);
    })
    .await
    .with_context(|| format!("Lost subscription to '{}' on {}", pattern, channel.address()))?;
    Ok(())
}
