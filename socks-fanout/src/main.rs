//! Binary entry point: loads configuration, builds the composition
//! root (Registry, Dispatcher, ConnectHandler, Listener, HealthChecker),
//! starts the hot-reload watcher and stats reporters, and drives
//! shutdown on Ctrl+C/SIGTERM.
//!
//! Several independent long-running tasks (listener, health checker,
//! config watcher, stats reporters) all have to observe the same
//! shutdown signal, so `run` coordinates their startup and teardown in
//! one place rather than spreading it across the tasks themselves.

mod stats_report;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use fanout_config::FanoutConfig;
use fanout_core::{ConnectHandler, Dispatcher, Listener};
use fanout_registry::{HealthChecker, ProxyDescriptor, Registry};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "socks-fanout", version, about = "HTTP/HTTPS forward proxy fanning out across a pool of upstream SOCKS5 proxies")]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(short, long, default_value = "config.json", env = "FANOUT_CONFIG")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    utils::init_tracing();
    let cli = Cli::parse();

    let cfg = match fanout_config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(target: "fanout::cli", config = %cli.config, error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(cfg, cli.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(target: "fanout::cli", error = %e, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: FanoutConfig, config_path: String) -> anyhow::Result<()> {
    info!(target: "fanout::cli", config = %config_path, "starting socks-fanout");

    let descriptors: Vec<ProxyDescriptor> = cfg.proxies.iter().map(ProxyDescriptor::from).collect();
    let registry = Arc::new(Registry::new(
        descriptors,
        &cfg.load_balancing_algorithm,
        cfg.max_retries,
        cfg.overload_backoff_base_secs,
        cfg.proxy_pool_max_per_addr,
    ));

    let io_timeout = Duration::from_secs_f64(cfg.connection_timeout.max(0.1));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), io_timeout));

    let tls_acceptor = match fanout_core::load_tls_acceptor(&cfg.ssl_cert, &cfg.ssl_key) {
        Ok(acceptor) => Some(acceptor),
        Err(e) => {
            warn!(
                target: "fanout::cli",
                cert = %cfg.ssl_cert,
                key = %cfg.ssl_key,
                error = %e,
                "could not load TLS cert/key; CONNECT :443 will raw-tunnel instead of terminating"
            );
            None
        }
    };

    let connect_handler = Arc::new(ConnectHandler::new(
        Arc::clone(&registry),
        Arc::clone(&dispatcher),
        tls_acceptor,
        io_timeout,
    ));

    let listener = Arc::new(Listener::new(
        Arc::clone(&dispatcher),
        Arc::clone(&connect_handler),
        fanout_core::DEFAULT_MAX_CONNECTIONS,
        io_timeout,
    ));

    let listen_addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let bound = listener.bind(&listen_addr).await?;
    let listener_handle = {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move { listener.serve(bound).await })
    };

    let tick = Duration::from_secs_f64(cfg.health_checker_tick_secs().max(0.05));
    let full_sweep = Duration::from_secs_f64(cfg.health_check_interval.max(0.05));
    let health_checker = Arc::new(HealthChecker::new(Arc::clone(&registry), tick, full_sweep));
    let health_handle = Arc::clone(&health_checker).spawn();

    let _config_watcher = {
        let registry = Arc::clone(&registry);
        match fanout_config::watch_config(&config_path, move |new_cfg: FanoutConfig| {
            let descriptors: Vec<ProxyDescriptor> =
                new_cfg.proxies.iter().map(ProxyDescriptor::from).collect();
            registry.update_proxies(descriptors);
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(target: "fanout::cli", error = %e, "could not start config hot-reload watcher");
                None
            }
        }
    };

    let _console_reporter = stats_report::spawn_console_reporter(
        Arc::clone(&registry),
        Duration::from_secs_f64(cfg.console_stats_interval.max(1.0)),
        cfg.compact_console_stats,
    );
    let _log_reporter = stats_report::spawn_log_summary(
        Arc::clone(&registry),
        Duration::from_secs_f64(cfg.stats_log_interval.max(1.0)),
    );

    info!(target: "fanout::cli", listen = %listen_addr, proxies = registry.all_descriptors().len(), "ready, waiting for connections (Ctrl+C to stop)");

    wait_for_shutdown_signal().await;
    info!(target: "fanout::cli", "shutdown signal received, stopping");

    listener.stop(listener_handle).await;
    health_checker.stop(health_handle).await;

    info!(target: "fanout::cli", "shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
