//! Quill CLI - run code on orchestrated kernels from the terminal.

mod colors;
mod run;
mod specs;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use quill_core::{BUILTIN_SPEC_NAME, KernelConfig, ReplyStatus};

#[derive(Parser)]
#[command(name = "quill")]
#[command(about = "Kernel orchestration for interactive notebooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the kernel specs that can be started
    Specs {
        /// Print the catalog as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start a kernel, run code on it and stop it again
    Run {
        /// Code to execute
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        code: Option<String>,

        /// Read the code from a file instead
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Kernel spec to start
        #[arg(long, default_value = BUILTIN_SPEC_NAME)]
        spec: String,

        /// Owner recorded on the kernel
        #[arg(long, default_value = "cli")]
        owner: String,

        /// Seconds to wait for the submission to finish
        #[arg(long, default_value_t = 600, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: u64,

        /// Print raw kernel messages as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Attach recovery hints to orchestration errors
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(quill_err) = err.downcast_ref::<quill_core::Error>() {
            anyhow::anyhow!("{}", quill_err.with_hint())
        } else {
            err
        }
    };

    let config = KernelConfig::from_env();

    match cli.command {
        Commands::Specs { json } => {
            specs::execute(config, json).await.map_err(format_error)?;
        }

        Commands::Run {
            code,
            file,
            spec,
            owner,
            timeout,
            json,
        } => {
            let code = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?,
                (None, None) => anyhow::bail!("nothing to run: pass code or --file"),
            };
            let status = run::execute(
                config,
                &spec,
                &owner,
                code,
                Duration::from_secs(timeout),
                json,
            )
                .await
                .map_err(format_error)?;
            if status != ReplyStatus::Ok {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
