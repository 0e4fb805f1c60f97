//! Per-kernel working areas.
//!
//! Each kernel instance gets a private directory under the runtime dir:
//!
//! ```text
//! <runtime_dir>/
//! └── kernel-<id>-<nonce>/
//!     └── connection.json   # connection descriptor handed to the engine
//! ```
//!
//! The nonce keeps a restarted kernel (same id) out of its predecessor's
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::protocol::ConnectionInfo;

/// Working area owned by exactly one kernel instance.
#[derive(Debug, Clone)]
pub struct KernelDirs {
    /// The kernel's private directory.
    pub root: PathBuf,

    /// Path of the connection descriptor inside `root`.
    pub connection_file: PathBuf,
}

impl KernelDirs {
    /// Create a fresh working area for `kernel_id` under `runtime_dir`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn create(runtime_dir: &Path, kernel_id: &str) -> Result<Self> {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let root = runtime_dir.join(format!("kernel-{}-{}", kernel_id, &nonce[..8]));
        fs::create_dir_all(&root)?;

        Ok(Self {
            connection_file: root.join("connection.json"),
            root,
        })
    }

    /// Write the connection descriptor.
    pub fn write_connection_file(&self, info: &ConnectionInfo) -> Result<()> {
        let json = serde_json::to_vec_pretty(info)?;
        fs::write(&self.connection_file, json)?;
        Ok(())
    }

    /// Remove the working area. Missing directories are not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
