//! Built-in tools offered to the API backend.

pub mod file;

use std::sync::Arc;

pub use file::{ListDirTool, ReadFileTool, WriteFileTool};

use crate::tools::ToolRegistry;

/// Registry preloaded with the workspace file tools.
pub fn builtin_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register_sync(Arc::new(ReadFileTool));
    registry.register_sync(Arc::new(WriteFileTool));
    registry.register_sync(Arc::new(ListDirTool));
    registry
}
