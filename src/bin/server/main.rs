//! Kuba Cardinality Estimator Server
//!
//! Runs in one of two roles:
//!
//! - **node** (`estimator.enabled`): tracks the cardinality of ingested
//!   series, resets on pushed or fixed schedules and publishes estimates
//! - **aggregator** (`aggregation.gauge_enabled` / `counter_enabled`): pushes
//!   staggered reset schedules to a fleet of nodes and merges their snapshots
//!
//! See [`kuba_cardinality::server`] for the HTTP endpoints.
//!
//! # CLI Commands
//!
//! - `start` - Start the HTTP server (default if no command specified)
//! - `check-config` - Validate configuration file
//!
//! # Configuration
//!
//! The server reads configuration from:
//! 1. `--config <path>`
//! 2. `CE_CONFIG` environment variable (path to TOML file)
//! 3. `./application.toml` in current directory
//! 4. Default configuration

mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use kuba_cardinality::{
    config::ApplicationConfig,
    estimator::CardinalityEstimator,
    metrics,
    server::{build_cors_layer, build_router, AppState},
    services::{
        aggregation::resolve_addresses, AggregateViews, CardinalityMetricEmitter,
        DiscoveryService, MergeService, PeerClient, Representation, ResetOperator,
        SchedulePushService, ServiceManager, SharedServiceManager,
    },
};
use prometheus::Registry;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Prefix of emitted node and gauge-view metrics
const GAUGE_PREFIX: &str = "ce_cardinality";

/// Prefix of emitted counter-view metrics
const COUNTER_PREFIX: &str = "ce_cardinality_count";

// =============================================================================
// CLI Definition
// =============================================================================

/// Kuba Cardinality - sharded HyperLogLog cardinality estimator
#[derive(Parser)]
#[command(name = "kuba-ce-server")]
#[command(author = "Victor Oseghale")]
#[command(version)]
#[command(about = "Cardinality estimator for time-series ingestion pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (overrides CE_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override listen address (e.g., 0.0.0.0:8481)
    #[arg(short, long, global = true)]
    listen: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Start,

    /// Validate configuration file without starting the server
    CheckConfig,
}

// =============================================================================
// CLI Command Handlers
// =============================================================================

/// Validate configuration and print summary
fn cmd_check_config(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let (app_config, source) = config::load_config(cli.config.as_deref())?;
    app_config.validate()?;

    println!("Configuration is valid! ({})", source);
    println!();
    println!("Server Settings:");
    println!("  Listen address: {}", app_config.server.listen_addr);
    println!("  Log level: {}", app_config.server.log_level);
    println!();
    println!("Estimator:");
    println!("  Enabled: {}", app_config.estimator.enabled);
    if app_config.estimator.enabled {
        println!("  Shards: {}", app_config.estimator.shards);
        println!("  Sample rate: 1/{}", app_config.estimator.sample_rate);
        match app_config.estimator.max_hlls_inuse {
            Some(max) => println!("  Max HLLs in use: {}", max),
            None => println!("  Max HLLs in use: unlimited"),
        }
    }
    println!();
    println!("Aggregation:");
    println!("  Gauge view: {}", app_config.aggregation.gauge_enabled);
    println!("  Counter view: {}", app_config.aggregation.counter_enabled);
    if app_config.aggregation.is_enabled() {
        let peers = resolve_addresses(&app_config.aggregation.nodes);
        println!("  Peers: {}", peers.len());
        println!(
            "  Lookback window: {}s",
            app_config.aggregation.lookback_window_secs
        );
    }

    Ok(())
}

// =============================================================================
// Service Wiring
// =============================================================================

/// Register node services and build the node's state
fn setup_node(
    app_config: &ApplicationConfig,
    manager: &ServiceManager,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let estimator = Arc::new(CardinalityEstimator::with_options(
        app_config.estimator.options(),
    ));

    let reset_operator = Arc::new(ResetOperator::new(
        estimator.clone(),
        app_config.reset.operator_config(),
    ));
    manager.register(reset_operator.clone())?;

    let mut state = AppState::node(estimator.clone(), Some(reset_operator));

    if app_config.emitter.enabled {
        let emitter = CardinalityMetricEmitter::new(
            estimator,
            app_config
                .emitter
                .emitter_config(GAUGE_PREFIX, app_config.emitter.representation),
        )?;
        state.registries.push(emitter.registry().clone());
        manager.register(Arc::new(emitter))?;
    }

    info!(
        shards = app_config.estimator.shards,
        sample_rate = app_config.estimator.sample_rate,
        "Node estimator enabled"
    );
    Ok(state)
}

/// Register aggregation services and build the aggregator's state
fn setup_aggregator(
    app_config: &ApplicationConfig,
    manager: &ServiceManager,
) -> Result<AppState, Box<dyn std::error::Error>> {
    let aggr = &app_config.aggregation;
    let options = app_config.estimator.options();
    let mut registries: Vec<Registry> = Vec::new();

    let gauge = aggr
        .gauge_enabled
        .then(|| Arc::new(CardinalityEstimator::with_options(options.clone())));
    let counter = aggr
        .counter_enabled
        .then(|| Arc::new(CardinalityEstimator::with_options(options.clone())));

    if let Some(gauge) = &gauge {
        if app_config.emitter.enabled {
            let emitter = CardinalityMetricEmitter::with_name(
                "gauge_emitter",
                gauge.clone(),
                app_config
                    .emitter
                    .emitter_config(GAUGE_PREFIX, Representation::Gauge),
            )?;
            registries.push(emitter.registry().clone());
            manager.register(Arc::new(emitter))?;
        }
    }

    if let Some(counter) = &counter {
        manager.register(Arc::new(ResetOperator::with_name(
            "counter_reset_operator",
            counter.clone(),
            app_config.reset.operator_config(),
        )))?;

        if app_config.emitter.enabled {
            let emitter = CardinalityMetricEmitter::with_name(
                "counter_emitter",
                counter.clone(),
                app_config
                    .emitter
                    .emitter_config(COUNTER_PREFIX, Representation::Counter),
            )?;
            registries.push(emitter.registry().clone());
            manager.register(Arc::new(emitter))?;
        }
    }

    let views = AggregateViews { gauge, counter };
    let client = PeerClient::new(Duration::from_secs(aggr.request_timeout_secs))?;

    let discovery = Arc::new(DiscoveryService::new(
        aggr.nodes.clone(),
        Duration::from_secs(aggr.discovery_interval_secs),
    ));
    let peers = discovery.subscribe();
    info!(peers = peers.borrow().len(), "Fleet aggregation enabled");
    manager.register(discovery)?;

    manager.register(Arc::new(SchedulePushService::new(
        client.clone(),
        peers.clone(),
        aggr.lookback_window(),
        Duration::from_secs(aggr.schedule_push_interval_secs),
    )))?;

    manager.register(Arc::new(MergeService::new(
        client,
        peers,
        views.clone(),
        aggr.fetch_concurrency,
        Duration::from_secs(aggr.merge_interval_secs),
    )))?;

    let mut state = AppState::aggregator(views);
    state.registries = registries;
    Ok(state)
}

// =============================================================================
// Shutdown
// =============================================================================

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {},
            Err(e) => {
                warn!(
                    error = %e,
                    "Ctrl+C handler installation failed - graceful shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(
                    error = %e,
                    "SIGTERM handler installation failed - SIGTERM shutdown unavailable"
                );
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::CheckConfig) => return cmd_check_config(&cli),
        Some(Commands::Start) | None => {},
    }

    let (mut app_config, source) = config::load_config(cli.config.as_deref())?;
    if let Some(listen) = &cli.listen {
        app_config.server.listen_addr = listen.clone();
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&app_config.server.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!(
        "Starting Kuba Cardinality Estimator v{}",
        env!("CARGO_PKG_VERSION")
    );
    debug!(source = %source, listen_addr = %app_config.server.listen_addr, "Configuration loaded");

    app_config.validate()?;
    metrics::init();

    let manager: SharedServiceManager = Arc::new(ServiceManager::with_defaults());
    let mut state = if app_config.aggregation.is_enabled() {
        setup_aggregator(&app_config, &manager)?
    } else if app_config.estimator.enabled {
        setup_node(&app_config, &manager)?
    } else {
        warn!("Neither the estimator nor aggregation is enabled; serving admin endpoints only");
        AppState::aggregator(AggregateViews::default())
    };

    manager.start_all().await?;
    state.services = Some(manager.clone());

    let app = build_router(Arc::new(state))
        .layer(build_cors_layer(&app_config.server.cors_allowed_origins))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = app_config.server.listen_addr.parse()?;
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await?;

    info!("Server shutdown complete");
    Ok(())
}
