//! MCP memory surface. The graph service itself is an external collaborator;
//! the core only needs a client seam, the Manager-only tool definitions, and
//! a disabled default.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

pub use crate::core::tools::{memory_definitions, MEMORY_TOOLS};

#[async_trait]
pub trait MemoryClient: Send + Sync {
    async fn call_tool(&self, name: &str, args: &Value) -> Result<Value>;
}

/// Stand-in when `MCP_MEMORY_ENABLED` is off or the service is unreachable.
pub struct DisabledMemory;

#[async_trait]
impl MemoryClient for DisabledMemory {
    async fn call_tool(&self, name: &str, _args: &Value) -> Result<Value> {
        bail!("memory tool `{name}` called while MCP memory is disabled")
    }
}

pub fn is_memory_tool(name: &str) -> bool {
    MEMORY_TOOLS.contains(&name)
}
