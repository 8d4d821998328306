//! Wind farm controller server with wake steering.
//!
//! Listens for turbine controllers, serves them until every one has
//! disconnected, and exits non-zero on timeout or any other fatal error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use wfc::{FileConfig, Server, ServerError};

/// Wind farm controller server for remote turbine controllers
#[derive(Parser, Debug)]
#[command(name = "wfc_server", version)]
#[command(about = "Serve wake steering setpoints to turbine controllers over ZeroMQ")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Endpoint to bind, like tcp://*:5555
    #[arg(short, long)]
    address: Option<String>,

    /// Seconds to wait for a request before giving up
    #[arg(short, long)]
    timeout: Option<f64>,

    /// Narrate every request on stdout
    #[arg(short, long)]
    verbose: bool,

    /// Append log records to this file
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// Channel schema file (TOML or JSON) replacing the configured schema
    #[arg(short, long)]
    schema: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wfc_server: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), ServerError> {
    let mut cfg = match &args.config {
        Some(path) => FileConfig::from_path(path)?,
        None => FileConfig::default(),
    };

    // Command line takes precedence over the file
    if let Some(address) = args.address {
        cfg.server.address = address;
    }
    if let Some(timeout_s) = args.timeout {
        cfg.server.timeout_s = timeout_s;
    }
    if args.verbose {
        cfg.server.verbose = true;
    }
    if let Some(logfile) = args.logfile {
        cfg.server.logfile = Some(logfile);
    }
    if let Some(schema_file) = args.schema {
        cfg.schema = None;
        cfg.schema_file = Some(schema_file);
    }

    let schema = cfg.schema()?;
    let controller = cfg.controller()?;
    let mut server = Server::bind(cfg.server.clone(), schema, Some(Box::new(controller)))?;
    server.run()?;

    for session in server.registry().sessions() {
        info!(
            "Turbine {} served {} requests, last seen {:?}",
            session.id, session.requests, session.last_seen
        );
    }
    Ok(())
}
