//! Workspace-scoped file tools for the API backend.
//!
//! Every path is resolved against the task workspace and rejected if it
//! escapes it. Writes report a [`FileChange`] so the job sees what was touched.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use tokio::fs;

use crate::backend::{FileChange, FileChangeKind};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Canonicalize the nearest existing ancestor and re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut ancestor = path;
    let mut tail = Vec::new();
    loop {
        if ancestor.exists() {
            let mut resolved = ancestor
                .canonicalize()
                .unwrap_or_else(|_| ancestor.to_path_buf());
            for part in tail.into_iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        if let Some(name) = ancestor.file_name() {
            tail.push(name);
        }
        match ancestor.parent() {
            Some(parent) if parent != ancestor => ancestor = parent,
            _ => return path.to_path_buf(),
        }
    }
}

/// The task's workspace, which file tools require.
fn workspace<'a>(tool: &str, ctx: &'a ToolContext) -> Result<&'a Path, ToolError> {
    ctx.workspace
        .as_deref()
        .ok_or_else(|| ToolError::NotAuthorized {
            name: tool.to_string(),
            reason: "task has no workspace".to_string(),
        })
}

/// Resolve a tool path inside the workspace, rejecting traversal.
fn validate_path(tool: &str, path_str: &str, base: &Path) -> Result<PathBuf, ToolError> {
    let path = Path::new(path_str);
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };
    let resolved = canonicalize_existing_prefix(&normalize_lexical(&joined));
    let base_canonical = base
        .canonicalize()
        .unwrap_or_else(|_| normalize_lexical(base));

    if !resolved.starts_with(&base_canonical) {
        return Err(ToolError::NotAuthorized {
            name: tool.to_string(),
            reason: format!("path escapes workspace: {path_str}"),
        });
    }
    Ok(resolved)
}

/// Path relative to the workspace for reporting.
fn display_path(path: &Path, base: &Path) -> String {
    let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    path.strip_prefix(&base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn failed(tool: &str, reason: String) -> ToolError {
    ToolError::ExecutionFailed {
        name: tool.to_string(),
        reason,
    }
}

/// Read file contents tool.
#[derive(Debug, Default)]
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Returns line-numbered content. \
         For large files, use offset and limit to read a portion."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-indexed, optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read (optional)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = self.name();
        let path_str = require_str(name, &params, "path")?;
        let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = params.get("limit").and_then(|v| v.as_u64());

        let start = Instant::now();
        let base = workspace(name, ctx)?;
        let path = validate_path(name, path_str, base)?;

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| failed(name, format!("Cannot access file: {e}")))?;
        if metadata.len() > MAX_READ_SIZE {
            return Err(failed(
                name,
                format!(
                    "File too large ({} bytes). Maximum is {} bytes.",
                    metadata.len(),
                    MAX_READ_SIZE
                ),
            ));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| failed(name, format!("Failed to read file: {e}")))?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();
        let start_line = offset.saturating_sub(1).min(total_lines);
        let end_line = match limit {
            Some(lim) => (start_line + lim as usize).min(total_lines),
            None => total_lines,
        };

        let selected: Vec<String> = lines[start_line..end_line]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}│ {}", start_line + i + 1, line))
            .collect();

        Ok(ToolOutput::success(
            serde_json::json!({
                "content": selected.join("\n"),
                "total_lines": total_lines,
                "lines_shown": end_line - start_line,
                "path": display_path(&path, base),
            }),
            start.elapsed(),
        ))
    }
}

/// Write file contents tool.
#[derive(Debug, Default)]
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace. Creates the file if it doesn't exist, \
         overwrites if it does. Parent directories are created automatically."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = self.name();
        let path_str = require_str(name, &params, "path")?;
        let content = require_str(name, &params, "content")?;

        let start = Instant::now();
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidParameters {
                name: name.to_string(),
                reason: format!(
                    "Content too large ({} bytes). Maximum is {} bytes.",
                    content.len(),
                    MAX_WRITE_SIZE
                ),
            });
        }

        let base = workspace(name, ctx)?;
        let path = validate_path(name, path_str, base)?;
        let existed = fs::try_exists(&path).await.unwrap_or(false);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| failed(name, format!("Failed to create directories: {e}")))?;
        }
        fs::write(&path, content)
            .await
            .map_err(|e| failed(name, format!("Failed to write file: {e}")))?;

        let relative = display_path(&path, base);
        let change = FileChange {
            path: relative.clone(),
            kind: if existed {
                FileChangeKind::Modified
            } else {
                FileChangeKind::Created
            },
        };

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": relative,
                "bytes_written": content.len(),
                "success": true
            }),
            start.elapsed(),
        )
        .with_file_change(change))
    }
}

/// List directory contents tool.
#[derive(Debug, Default)]
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the contents of a workspace directory. Directories end with '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory relative to the workspace (defaults to the root)"
                }
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let name = self.name();
        let path_str = params.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let start = Instant::now();
        let base = workspace(name, ctx)?;
        let path = validate_path(name, path_str, base)?;

        let mut dir = fs::read_dir(&path)
            .await
            .map_err(|e| failed(name, format!("Failed to read directory: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| failed(name, format!("Failed to read entry: {e}")))?
        {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            let mut label = entry.file_name().to_string_lossy().into_owned();
            if is_dir {
                label.push('/');
            }
            entries.push(label);
        }

        // Directories first, then alphabetical.
        entries.sort_by(|a, b| (!a.ends_with('/'), a).cmp(&(!b.ends_with('/'), b)));
        let truncated = entries.len() > MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);

        Ok(ToolOutput::success(
            serde_json::json!({
                "path": display_path(&path, base),
                "count": entries.len(),
                "entries": entries,
                "truncated": truncated
            }),
            start.elapsed(),
        ))
    }
}
