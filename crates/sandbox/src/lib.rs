//! Sandbox Provider contract.
//!
//! Relay does not implement sandboxes; it drives an external provider
//! that hosts an isolated filesystem, shell, and browser per project.
//! Tool handlers receive this trait by composition.

pub mod http;

pub use http::HttpSandboxProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use relay_domain::error::Result;

/// Reference to a provisioned sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
}

/// Output of a shell command executed inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// One directory entry from a sandbox listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// The operations the core needs from a sandbox host. Every method is a
/// suspension point; implementations must respect their configured
/// timeouts and surface provider errors as `UpstreamFailure` /
/// `UpstreamTimeout`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Provision a new sandbox for a project.
    async fn create(&self, project_id: Uuid) -> Result<SandboxHandle>;

    async fn start(&self, sandbox_id: &str) -> Result<()>;

    async fn stop(&self, sandbox_id: &str) -> Result<()>;

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, sandbox_id: &str, path: &str, contents: &[u8]) -> Result<()>;

    async fn delete_file(&self, sandbox_id: &str, path: &str) -> Result<()>;

    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileEntry>>;
}
