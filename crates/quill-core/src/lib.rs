//! Kernel orchestration for Quill notebooks.
//!
//! This crate provides:
//! - Kernel spec catalog with discovery of installed kernelspecs
//! - Process supervision for local kernel engines
//! - Line-delimited JSON protocol between orchestrator and engines
//! - Output fan-out to many subscribed sessions
//! - Optional delegation to a remote kernel gateway
//!
//! [`KernelManager`] is the entry point.

pub mod config;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod kernel;
pub mod manager;
pub mod paths;
pub mod protocol;
pub mod spec;
pub mod supervisor;

pub use config::{GatewayConfig, KernelConfig, ReadinessPolicy};
pub use error::{Error, Result};
pub use fanout::{OutputFanout, Sink, SinkReceiver, sink};
pub use gateway::{GatewayAdapter, GatewayClient, GatewayKernelRef, HttpGatewayClient, RemoteKernel};
pub use kernel::{KernelInfo, KernelState, KernelStatus};
pub use manager::KernelManager;
pub use paths::KernelDirs;
pub use protocol::{
    ConnectionInfo, Directive, ExecuteRequest, ExecutionState, KernelMessage, MessageContent,
    MimeBundle, ReplyStatus, StreamName,
};
pub use spec::{BUILTIN_SPEC_NAME, KernelSpec, SpecCatalog};
pub use supervisor::KernelIo;
