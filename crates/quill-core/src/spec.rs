//! Kernel spec catalog.
//!
//! A spec names a kind of kernel and says how to launch it. The catalog
//! merges built-in specs with specs discovered by an external command
//! (by default `jupyter kernelspec list --json`). Built-ins win on name
//! collisions; discovered specs only fill gaps.
//!
//! The supervisor speaks line-delimited JSON over the kernel's stdio, so a
//! discovered spec is only offered if its `kernel.json` metadata declares
//! that protocol (`"metadata": {"quill_protocol": "line"}`). Anything else,
//! such as a stock ipykernel, is skipped with a log line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::config::KernelConfig;
use crate::error::{Error, Result};

/// Placeholder in `launch_argv` replaced by the connection file path.
pub const CONNECTION_FILE_PLACEHOLDER: &str = "{connection_file}";

/// Metadata key a discovered kernel spec sets to opt into quill's protocol.
pub const PROTOCOL_METADATA_KEY: &str = "quill_protocol";

/// The only protocol the supervisor can drive.
pub const LINE_PROTOCOL: &str = "line";

/// Name of the built-in engine spec.
pub const BUILTIN_SPEC_NAME: &str = "quill";

/// How to launch one kind of kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Unique key.
    pub name: String,
    pub display_name: String,
    pub language: String,
    /// Command line template. `{connection_file}` is substituted at spawn.
    pub launch_argv: Vec<String>,
    /// Extra environment for the kernel process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl KernelSpec {
    /// Spec for the `quill-engine` binary shipped with this workspace.
    pub fn builtin_engine() -> Self {
        let engine = find_engine_binary().unwrap_or_else(|| PathBuf::from(engine_binary_name()));
        Self::for_engine(engine)
    }

    /// Spec that launches the engine binary at `path`.
    pub fn for_engine(path: impl AsRef<Path>) -> Self {
        Self {
            name: BUILTIN_SPEC_NAME.to_string(),
            display_name: "Quill".to_string(),
            language: "quill".to_string(),
            launch_argv: vec![
                path.as_ref().to_string_lossy().to_string(),
                "--connection-file".to_string(),
                CONNECTION_FILE_PLACEHOLDER.to_string(),
            ],
            env: BTreeMap::new(),
        }
    }

    /// The launch command with the connection file substituted.
    pub fn launch_command(&self, connection_file: &Path) -> Vec<String> {
        let path = connection_file.to_string_lossy();
        self.launch_argv
            .iter()
            .map(|arg| arg.replace(CONNECTION_FILE_PLACEHOLDER, &path))
            .collect()
    }
}

/// Merged view over built-in and discovered kernel specs.
pub struct SpecCatalog {
    builtin: Vec<KernelSpec>,
    discovery_command: Option<Vec<String>>,
    discovery_timeout: Duration,
    /// Discovered specs, listed once on first use.
    discovered: OnceCell<Vec<KernelSpec>>,
}

impl SpecCatalog {
    /// Create a catalog over explicit built-ins.
    pub fn new(
        builtin: Vec<KernelSpec>,
        discovery_command: Option<Vec<String>>,
        discovery_timeout: Duration,
    ) -> Self {
        Self {
            builtin,
            discovery_command,
            discovery_timeout,
            discovered: OnceCell::new(),
        }
    }

    /// Catalog with the built-in engine and the configured discovery command.
    pub fn from_config(config: &KernelConfig) -> Self {
        Self::new(
            vec![KernelSpec::builtin_engine()],
            config.discovery_command.clone(),
            config.discovery_timeout,
        )
    }

    /// All available specs, sorted by name.
    pub async fn list(&self) -> Vec<KernelSpec> {
        let mut specs = self.builtin.clone();
        for spec in self.discovered().await {
            if !specs.iter().any(|s| s.name == spec.name) {
                specs.push(spec.clone());
            }
        }
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Look up a spec by name.
    pub async fn resolve(&self, name: &str) -> Result<KernelSpec> {
        if let Some(spec) = self.builtin.iter().find(|s| s.name == name) {
            return Ok(spec.clone());
        }
        self.discovered()
            .await
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::SpecNotFound(name.to_string()))
    }

    async fn discovered(&self) -> &[KernelSpec] {
        self.discovered
            .get_or_init(|| async {
                match &self.discovery_command {
                    Some(argv) => run_discovery(argv, self.discovery_timeout).await,
                    None => Vec::new(),
                }
            })
            .await
    }
}

/// Run the discovery command. Any failure yields an empty set.
async fn run_discovery(argv: &[String], timeout: Duration) -> Vec<KernelSpec> {
    let Some((program, args)) = argv.split_first() else {
        return Vec::new();
    };

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            tracing::debug!("Kernel spec discovery exited with {}", output.status);
            return Vec::new();
        }
        Ok(Err(e)) => {
            tracing::debug!("Kernel spec discovery unavailable: {}", e);
            return Vec::new();
        }
        Err(_) => {
            tracing::warn!("Kernel spec discovery timed out after {:?}", timeout);
            return Vec::new();
        }
    };

    match parse_kernelspec_listing(&String::from_utf8_lossy(&output.stdout)) {
        Ok(specs) => {
            tracing::debug!("Discovered {} kernel specs", specs.len());
            specs
        }
        Err(e) => {
            tracing::warn!("Ignoring malformed kernel spec listing: {}", e);
            Vec::new()
        }
    }
}

#[derive(Deserialize)]
struct Listing {
    kernelspecs: BTreeMap<String, ListingEntry>,
}

#[derive(Deserialize)]
struct ListingEntry {
    spec: ListingSpec,
}

#[derive(Deserialize)]
struct ListingSpec {
    argv: Vec<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
}

impl ListingSpec {
    fn speaks_line_protocol(&self) -> bool {
        self.metadata
            .get(PROTOCOL_METADATA_KEY)
            .and_then(serde_json::Value::as_str)
            == Some(LINE_PROTOCOL)
    }
}

/// Parse the JSON printed by `jupyter kernelspec list --json`.
///
/// Specs with an empty argv, or that do not declare the line protocol in
/// their metadata, are left out.
pub fn parse_kernelspec_listing(json: &str) -> Result<Vec<KernelSpec>> {
    let listing: Listing = serde_json::from_str(json)?;
    Ok(listing
        .kernelspecs
        .into_iter()
        .filter(|(name, entry)| {
            if entry.spec.argv.is_empty() {
                tracing::debug!("Skipping kernel spec {}: empty argv", name);
                return false;
            }
            if !entry.spec.speaks_line_protocol() {
                tracing::info!(
                    "Skipping kernel spec {}: {} is not \"{}\"",
                    name,
                    PROTOCOL_METADATA_KEY,
                    LINE_PROTOCOL
                );
                return false;
            }
            true
        })
        .map(|(name, entry)| KernelSpec {
            display_name: entry.spec.display_name.unwrap_or_else(|| name.clone()),
            language: entry.spec.language.unwrap_or_default(),
            launch_argv: entry.spec.argv,
            env: entry.spec.env,
            name,
        })
        .collect())
}

fn engine_binary_name() -> &'static str {
    if cfg!(windows) {
        "quill-engine.exe"
    } else {
        "quill-engine"
    }
}

/// Find the quill-engine binary path.
///
/// Looks in order at:
/// 1. `QUILL_ENGINE_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. Workspace `target/{debug,release}` (development)
pub fn find_engine_binary() -> Option<PathBuf> {
    // 1. Check environment variable
    if let Ok(path) = std::env::var("QUILL_ENGINE_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. Look next to current executable
    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        let engine_path = exe_dir.join(engine_binary_name());
        if engine_path.exists() {
            return Some(engine_path);
        }
        // Test binaries live one level down in target/<profile>/deps
        if let Some(profile_dir) = exe_dir.parent() {
            let engine_path = profile_dir.join(engine_binary_name());
            if engine_path.exists() {
                return Some(engine_path);
            }
        }
    }

    // 3. Try system PATH via which
    if let Ok(path) = which::which(engine_binary_name()) {
        return Some(path);
    }

    // 4. For development: try target/debug or target/release
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(engine_binary_name());
            if path.exists() {
                return Some(path.canonicalize().unwrap_or(path));
            }
        }
    }

    None
}
