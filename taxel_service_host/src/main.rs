//! # Taxel Service Host
//!
//! Registers and runs the skin sensor services declared in a TOML
//! manifest, then idles until a shutdown signal arrives. On SIGINT the
//! shared shutdown token is raised; every runtime drains its current
//! invocation, buffers are unlinked, and the host exits.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use taxel::record::TaxelSample;
use taxel_services::{ServiceDescriptor, ServiceManager, Substrate};

mod config;
mod routines;

use config::load_config;

/// Taxel Service Host — runs skin sensor services from a manifest
#[derive(Parser, Debug)]
#[command(name = "taxel_service_host")]
#[command(version)]
#[command(about = "Host process for shared-memory skin sensor services")]
struct Args {
    /// Path to the service manifest TOML.
    #[arg(default_value = "config/host.toml")]
    config: PathBuf,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format.
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Taxel Service Host v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("Taxel Service Host shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = load_config(&args.config)?;
    info!(
        "Manifest OK: {} services from {}",
        manifest.services.len(),
        args.config.display()
    );

    let substrate = Substrate::load()?;
    let manager = ServiceManager::new(&substrate);

    for service in &manifest.services {
        let descriptor = ServiceDescriptor::new(
            service.name.clone(),
            core::mem::size_of::<TaxelSample>(),
            service.element_count,
            service.temporal_class(),
            service.request_tag.into(),
            service.response_tag.into(),
        )?;
        let id = manager.register(descriptor)?;
        let routine = routines::build(&substrate, service)?;
        manager.start_service(id, routine)?;
        info!(%id, name = %service.name, "service started");
    }

    let signal_substrate = substrate.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        signal_substrate.request_shutdown();
    })?;

    info!("All services running; waiting for shutdown signal");
    while !substrate.is_shutdown_requested() {
        std::thread::sleep(Duration::from_millis(200));
    }

    for id in manager.service_ids() {
        if let Ok(stats) = manager.stats(id) {
            info!(
                %id,
                invocations = stats.invocation_count,
                avg_ns = stats.avg_ns(),
                max_ns = stats.max_ns,
                deadline_misses = stats.deadline_misses,
                coalesced = stats.coalesced_triggers,
                routine_errors = stats.routine_errors,
                "service statistics"
            );
        }
    }

    manager.stop_all();
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}
