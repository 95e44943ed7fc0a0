use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info, warn};
use metrics_exporter_prometheus::PrometheusBuilder;
use nut_exporter::config::PASSWORD_ENV;
use nut_exporter::http::spawn_upkeep;
use nut_exporter::{AppState, Args, Error, NutCollector, RupsConnector, Translator};
use std::sync::Arc;
use std::time::Duration;
use std::{env, process};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    // Initialize logging
    Builder::from_env(Env::default().default_filter_or("info")).init();

    // Parse configuration
    let args = Args::parse();
    let password = env::var(PASSWORD_ENV).ok();
    let defaults = args.scrape_options(password).unwrap_or_else(|err| {
        error!("Cannot authenticate: {err}");
        process::exit(2);
    });
    if let Err(err) = Translator::new(&defaults) {
        error!("Invalid configuration: {err}");
        process::exit(1);
    }
    let paths = args.web_paths().unwrap_or_else(|err| {
        error!("Invalid configuration: {err}");
        process::exit(1);
    });

    if args.print_metrics {
        print_metrics(&defaults).await;
        return;
    }

    info!(
        "Starting nut_exporter {}, NUT server {}:{}",
        env!("CARGO_PKG_VERSION"),
        defaults.server,
        defaults.server_port
    );
    if defaults.credentials.is_some() {
        info!("Authenticating to NUT server");
    }

    // Exporter metrics
    let handle = PrometheusBuilder::new().install_recorder().unwrap_or_else(|err| {
        error!("Failed to install metrics recorder: {err}");
        process::exit(1);
    });
    spawn_upkeep(handle.clone(), UPKEEP_INTERVAL);
    metrics::gauge!(format!("{}_build_info", defaults.namespace), "version" => env!("CARGO_PKG_VERSION")).set(1.0);

    let state = AppState::new(defaults, Arc::new(RupsConnector), paths).with_self_metrics(handle);
    let app = nut_exporter::router(Arc::new(state));

    let listener = TcpListener::bind(args.listen_address).await.unwrap_or_else(|err| {
        error!("Failed to listen on {}: {err}", args.listen_address);
        process::exit(1);
    });
    info!("Listening on {}", args.listen_address);

    if let Err(err) = axum::serve(listener, app).with_graceful_shutdown(shutdown()).await {
        error!("Server failed: {err}");
        process::exit(1);
    }
    info!("Server shutdown");
}

/// Print the declared metrics of a collector built from the defaults.
#[allow(clippy::print_stdout)]
async fn print_metrics(defaults: &nut_exporter::ScrapeOptions) {
    let built = tokio::time::timeout(defaults.timeout, NutCollector::new(defaults.clone(), Arc::new(RupsConnector)))
        .await
        .unwrap_or(Err(Error::Deadline(defaults.timeout)));
    match built {
        Ok(collector) => {
            println!("NUT");
            for desc in collector.descriptors() {
                println!("  {} - {}", desc.fq_name, desc.help);
            }
        }
        Err(err) => {
            error!("Could not build collector: {err}");
            process::exit(1);
        }
    }
}

/// Wait for either SIGTERM or SIGINT.
async fn shutdown() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!("Could not listen for SIGTERM: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
