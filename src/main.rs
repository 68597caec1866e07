use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowrunner::cc::HttpCommandGateway;
use flowrunner::cli::{format_dry_run, Args};
use flowrunner::config::load_settings_file;
use flowrunner::coordinator::JobCoordinator;
use flowrunner::hooks::start_router;
use flowrunner::server::{create_router, AppState};
use flowrunner::store::MemoryStore;
use flowrunner::tree::{load_flow_dir, FlowRegistry};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load and validate settings
    let settings = match load_settings_file(&args.settings_file) {
        Ok(settings) => settings,
        Err(e) => {
            error!(
                "Failed to load settings file {}: {}",
                args.settings_file.display(),
                e
            );
            process::exit(1);
        }
    };

    // Load flow definitions
    let flows = Arc::new(FlowRegistry::new());
    if let Some(ref dir) = args.flows_dir {
        match load_flow_dir(&flows, dir) {
            Ok(count) => info!("Loaded {} flows from {}", count, dir.display()),
            Err(e) => {
                error!("Failed to load flows from {}: {}", dir.display(), e);
                process::exit(1);
            }
        }
    }

    // Dry-run mode: print settings and flows and exit
    if args.dry_run {
        let output = format_dry_run(&settings, &flows, &args);
        println!("{}", output);
        return;
    }

    // Wire the coordinator and callback workers
    let settings = Arc::new(settings);
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(HttpCommandGateway::new(
        settings.queue_url.clone(),
        settings.cmd_url.clone(),
        settings.cmd_stop_url.clone(),
    ));
    let coordinator = Arc::new(JobCoordinator::new(
        settings.clone(),
        flows.clone(),
        store,
        gateway,
    ));
    let (callbacks, _workers) = start_router(
        coordinator.clone(),
        settings.callback_workers,
        settings.queue_capacity,
    );

    let state = AppState::new(coordinator, flows, callbacks);

    let bind_addr = args.bind_addr.as_deref().unwrap_or("0.0.0.0");
    let port = args.port.unwrap_or(8080);
    let addr = format!("{}:{}", bind_addr, port);

    info!("Starting flowrunner on {}", addr);

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Server listening on {}", addr);
    info!("Endpoints:");
    info!("  GET  /health                             - Health check");
    info!("  GET  /status                             - Orchestrator status");
    info!("  POST /hooks/cmd                          - Command-control webhook");
    info!("  GET  /jobs                               - List jobs");
    info!("  POST /flows/{{flow}}/jobs                  - Create a job");
    info!("  GET  /flows/{{flow}}/jobs/{{number}}         - Job detail");
    info!("  GET  /flows/{{flow}}/jobs/{{number}}/results - Node results");
    info!("  POST /flows/{{flow}}/jobs/{{number}}/stop    - Stop a job");

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
