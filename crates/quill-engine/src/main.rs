//! Quill engine process.
//!
//! Launched by the kernel supervisor with piped stdio. stdout carries
//! protocol records only; all logging goes to stderr.

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use clap::Parser;
use quill_core::protocol::ConnectionInfo;
use quill_engine::{Engine, InterruptFlag, serve};

#[derive(Parser)]
#[command(name = "quill-engine")]
#[command(about = "Execution engine for Quill kernels")]
#[command(version)]
struct Args {
    /// Connection descriptor written by the supervisor
    #[arg(long)]
    connection_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Some(path) = &args.connection_file {
        match read_connection_file(path) {
            Ok(info) => tracing::debug!(
                "Connection file {} for kernel {}",
                path.display(),
                info.kernel_name
            ),
            Err(e) => tracing::warn!("Ignoring connection file {}: {}", path.display(), e),
        }
    }

    let kernel_id = std::env::var(quill_core::supervisor::KERNEL_ID_ENV).unwrap_or_default();
    tracing::info!("Engine starting for kernel {}", kernel_id);

    let engine = Engine::new(InterruptFlag::sigint());
    serve(engine, BufReader::new(io::stdin()), io::stdout().lock())?;

    tracing::info!("Engine for kernel {} exiting", kernel_id);
    Ok(())
}

fn read_connection_file(path: &Path) -> anyhow::Result<ConnectionInfo> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
