//! Runs the lab maintenance workflow and prints the report.
//!
//! # Usage
//!
//! ```bash
//! fleet [device-count] [--parallel] [--faults]
//! ```
//!
//! `--faults` makes `edge-2` unreachable and takes the management interface
//! of `edge-3` down. `ARMADA_*` variables tune the engine; `RUST_LOG` style
//! filters go in `FLEET_LOG`.

use std::sync::Arc;

use armada_runtime::prelude::*;
use armada_workflow::policy::RunMode;
use example::{Fault, LabDriver, lab_engine, lab_inventory, maintenance_workflow};
use tracing::Level;

#[expect(
    clippy::print_stdout,
    clippy::print_stderr,
    reason = "CLI binary reports to the terminal"
)]
#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let mut tracing = TracingConfig::new()
        .with_level(Level::INFO)
        .with_format(TracingFormat::Compact);
    if let Ok(filter) = std::env::var("FLEET_LOG") {
        tracing = tracing.with_env_filter(filter);
    }
    tracing.init();

    let mut count = 4;
    let mut run_mode = RunMode::PerDevice;
    let mut faults = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--parallel" => run_mode = RunMode::PerDeviceParallel,
            "--faults" => faults = true,
            other => match other.parse::<u64>() {
                Ok(n) if n > 0 => count = n,
                _ => {
                    eprintln!("Usage: fleet [device-count] [--parallel] [--faults]");
                    std::process::exit(2);
                }
            },
        }
    }

    let mut driver = LabDriver::new();
    if faults {
        driver = driver
            .with_fault("edge-2", Fault::Unreachable)
            .with_fault("edge-3", Fault::MgmtDown);
    }

    let engine = match lab_engine(lab_inventory(count), driver) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let service = match maintenance_workflow(run_mode) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match engine.run(Arc::new(service), RunRequest::new("fleet")).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("Error: cannot encode report: {e}"),
            }
            if !report.success {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
