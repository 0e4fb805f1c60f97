//! `quill specs`: print the merged kernel spec catalog.

use quill_core::{KernelConfig, KernelManager};

use crate::colors;

pub async fn execute(config: KernelConfig, json: bool) -> anyhow::Result<()> {
    let manager = KernelManager::new(config).await;
    let specs = manager.list_specs().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    let width = specs.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for spec in &specs {
        println!(
            "{}{:<width$}{}  {}  {}({}){}",
            colors::BOLD,
            spec.name,
            colors::RESET,
            spec.display_name,
            colors::DIM,
            spec.language,
            colors::RESET,
        );
    }
    if manager.gateway_active() {
        println!("{}(kernels are delegated to a remote gateway){}", colors::DIM, colors::RESET);
    }

    Ok(())
}
