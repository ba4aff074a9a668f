//! Subprocess backend for coding CLIs.
//!
//! Provides controlled execution with:
//! - Environment isolation (explicit allowlist plus task overrides)
//! - Line-oriented JSON output parsing, raw text fallback
//! - Exit-code classification
//! - Kill on cancel or stop

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::handle::{self, Canceller, ExecutionHandle, HandleSink};
use super::types::{
    BackendCapabilities, BackendHealthReport, ErrorClassification, ExecutionError,
    ExecutionResult, ExecutionTask, FileChange, FileChangeKind, GoalType, OutputEvent,
    TokenUsage,
};
use super::{BackendConfig, BackendKind, ExecutionBackend, HEALTH_CHECK_TIMEOUT, wrong_kind};
use crate::config::CliBackendConfig;
use crate::error::BackendError;

/// Maximum captured stdout/stderr kept in the result (64KB each).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// How long `stop` waits for a cancelled run to kill and reap its child.
const STOP_GRACE: Duration = Duration::from_secs(2);

const STOP_REASON: &str = "backend stopped";

/// One line of the CLI's structured output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliLine {
    Text {
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        #[serde(default)]
        id: String,
        #[serde(default)]
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    FileChange {
        path: String,
        #[serde(default = "default_change_kind")]
        kind: FileChangeKind,
    },
    Progress {
        message: String,
        percent: Option<f32>,
    },
    Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
    Result {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        is_error: bool,
    },
}

fn default_change_kind() -> FileChangeKind {
    FileChangeKind::Modified
}

/// What a stdout line means to the execution.
#[derive(Debug, PartialEq)]
enum ParsedLine {
    Event(OutputEvent),
    Final { summary: String, is_error: bool },
}

/// Parse a stdout line. Anything that is not a known JSON record is text.
fn parse_line(line: &str) -> ParsedLine {
    let record = match serde_json::from_str::<CliLine>(line) {
        Ok(record) => record,
        Err(_) => return ParsedLine::Event(OutputEvent::text(line)),
    };
    let event = match record {
        CliLine::Text { text } => OutputEvent::Text { text },
        CliLine::ToolUse { id, name, input } => OutputEvent::ToolUse { id, name, input },
        CliLine::ToolResult {
            id,
            output,
            is_error,
        } => OutputEvent::ToolResult {
            id,
            output,
            is_error,
        },
        CliLine::FileChange { path, kind } => OutputEvent::FileChange {
            change: FileChange { path, kind },
        },
        CliLine::Progress { message, percent } => OutputEvent::Progress { message, percent },
        CliLine::Usage {
            input_tokens,
            output_tokens,
        } => OutputEvent::Usage {
            usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
        },
        CliLine::Result { summary, is_error } => {
            return ParsedLine::Final { summary, is_error };
        }
    };
    ParsedLine::Event(event)
}

/// Map a process exit to a failure class. `None` means success.
fn classify_exit(status: &ExitStatus) -> Option<ErrorClassification> {
    match status.code() {
        Some(0) => None,
        // SIGKILL / SIGTERM surfaced as 128 + signal by wrappers (e.g. OOM killer).
        Some(137) | Some(143) => Some(ErrorClassification::Resource),
        Some(_) => Some(ErrorClassification::Permanent),
        // Terminated by a signal.
        None => Some(ErrorClassification::Resource),
    }
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn exit_code_of(status: &ExitStatus) -> Option<i32> {
    status.code()
}

/// Build the child environment: allowlisted host variables, then task overrides.
fn child_environment(
    allowlist: &[String],
    host: impl Fn(&str) -> Option<String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = allowlist
        .iter()
        .filter_map(|key| host(key).map(|value| (key.clone(), value)))
        .collect();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Render the task into the text written to the CLI's stdin.
fn render_prompt(task: &ExecutionTask) -> String {
    let mut out = String::new();
    if let Some(system) = &task.context.system_prompt {
        out.push_str(system);
        out.push_str("\n\n");
    }
    if !task.context.memories.is_empty() {
        out.push_str("Relevant memories:\n");
        for memory in &task.context.memories {
            out.push_str("- ");
            out.push_str(memory);
            out.push('\n');
        }
        out.push('\n');
    }
    for file in &task.context.preloaded_files {
        out.push_str(&format!("<file path=\"{}\">\n{}\n</file>\n\n", file.path, file.content));
    }
    for turn in &task.instruction.prior_turns {
        out.push_str(&format!("[{}] {}\n", turn.role, turn.content));
    }
    if !task.instruction.target_files.is_empty() {
        out.push_str(&format!(
            "Target files: {}\n\n",
            task.instruction.target_files.join(", ")
        ));
    }
    out.push_str(&task.instruction.prompt);
    out
}

/// Append to a capture buffer, stopping at the cap.
fn push_capped(buf: &mut String, line: &str) {
    if buf.len() >= MAX_OUTPUT_SIZE {
        return;
    }
    let room = MAX_OUTPUT_SIZE - buf.len();
    if line.len() < room {
        buf.push_str(line);
        buf.push('\n');
    } else {
        let mut cut = room;
        while cut > 0 && !line.is_char_boundary(cut) {
            cut -= 1;
        }
        buf.push_str(&line[..cut]);
    }
}

/// Locate an executable by absolute/relative path or in PATH.
fn resolve_binary(binary: &str) -> Option<PathBuf> {
    let path = Path::new(binary);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

struct CliState {
    config: CliBackendConfig,
    binary: PathBuf,
}

/// Coding-CLI backend driven through a subprocess per task.
pub struct CliBackend {
    id: String,
    state: RwLock<Option<CliState>>,
    running: Mutex<Vec<(JoinHandle<()>, Canceller)>>,
}

impl CliBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(None),
            running: Mutex::new(Vec::new()),
        }
    }

    fn spawn_child(
        &self,
        state: &CliState,
        task: &ExecutionTask,
    ) -> Result<Child, BackendError> {
        let env = child_environment(
            &state.config.env_allowlist(),
            |key| std::env::var(key).ok(),
            &task.context.environment,
        );

        let mut command = Command::new(&state.binary);
        command
            .args(&state.config.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = task
            .context
            .workspace
            .as_ref()
            .or(state.config.working_dir.as_ref())
        {
            command.current_dir(dir);
        }

        command.spawn().map_err(|e| BackendError::Execution {
            id: self.id.clone(),
            message: format!("Failed to spawn {}: {}", state.binary.display(), e),
            classification: match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ErrorClassification::Permanent
                }
                _ => ErrorClassification::Resource,
            },
        })
    }

    /// Drive one child process to completion.
    async fn run(mut child: Child, sink: HandleSink, prompt: String) {
        let started = Instant::now();
        let task_id = sink.task_id().to_string();

        if let Some(mut stdin) = child.stdin.take() {
            // The child may never read stdin; a broken pipe is not our failure.
            tokio::spawn(async move {
                let _ = stdin.write_all(prompt.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = (&mut err)
                    .take(MAX_OUTPUT_SIZE as u64)
                    .read_to_end(&mut buf)
                    .await;
                // Keep draining so the child never blocks on a full pipe.
                let _ = tokio::io::copy(&mut err, &mut tokio::io::sink()).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let mut stdout = String::new();
        let mut last_text = String::new();
        let mut final_line: Option<(String, bool)> = None;
        let mut file_changes = Vec::new();
        let mut usage = TokenUsage::default();

        if let Some(out) = child.stdout.take() {
            let mut reader = BufReader::new(out);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let read = tokio::select! {
                    _ = sink.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                    read = reader.read_until(b'\n', &mut buf) => read,
                };
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, "Failed reading CLI output: {}", e);
                        // Dropping the pipe would SIGPIPE the child, so drain it instead.
                        tokio::spawn(async move {
                            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                        });
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if line.trim().is_empty() {
                    continue;
                }
                push_capped(&mut stdout, line);

                match parse_line(line) {
                    ParsedLine::Final { summary, is_error } => {
                        final_line = Some((summary, is_error));
                    }
                    ParsedLine::Event(event) => {
                        match &event {
                            OutputEvent::Text { text } => last_text = text.clone(),
                            OutputEvent::FileChange { change } => {
                                file_changes.push(change.clone())
                            }
                            OutputEvent::Usage { usage: u } => usage.add(*u),
                            _ => {}
                        }
                        if !sink.emit(event).await {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = sink.cancelled() => {
                let _ = child.kill().await;
                return;
            }
            status = child.wait() => status,
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let error = ExecutionError::new(
                    format!("Failed waiting for CLI process: {e}"),
                    ErrorClassification::Transient,
                )
                .partial(!stdout.is_empty());
                sink.finish(
                    ExecutionResult::failed(&task_id, error).with_duration(started.elapsed()),
                )
                .await;
                return;
            }
        };

        let exit_code = exit_code_of(&status);
        let (summary, reported_error) = match final_line {
            Some((summary, is_error)) => (summary, is_error),
            None => (last_text, false),
        };

        let mut result = match classify_exit(&status) {
            None if !reported_error => ExecutionResult::completed(&task_id, summary),
            None => ExecutionResult::failed(
                &task_id,
                ExecutionError::new(summary, ErrorClassification::Permanent)
                    .partial(!file_changes.is_empty()),
            ),
            Some(classification) => {
                let detail = stderr.lines().last().unwrap_or("").trim();
                let message = format!(
                    "CLI exited with code {}{}",
                    exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                    if detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {detail}")
                    }
                );
                let mut error = ExecutionError::new(message, classification)
                    .partial(!stdout.is_empty());
                if let Some(code) = exit_code {
                    error = error.with_code(code.to_string());
                }
                ExecutionResult::failed(&task_id, error)
            }
        };
        result.exit_code = exit_code;
        result.stdout = stdout;
        result.stderr = stderr;
        result.file_changes = file_changes;
        result.usage = usage;
        result.duration = started.elapsed();

        tracing::debug!(
            task_id = %task_id,
            status = ?result.status,
            exit_code = ?exit_code,
            "CLI execution finished"
        );
        sink.finish(result).await;
    }
}

#[async_trait]
impl ExecutionBackend for CliBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cli
    }

    async fn start(&self, config: &BackendConfig) -> Result<(), BackendError> {
        let BackendConfig::Cli(config) = config else {
            return Err(wrong_kind(&self.id, BackendKind::Cli, config));
        };

        let binary = resolve_binary(&config.binary).ok_or_else(|| BackendError::BinaryNotFound {
            id: self.id.clone(),
            binary: config.binary.clone(),
        })?;

        tracing::info!(backend = %self.id, binary = %binary.display(), "CLI backend started");
        *self.state.write().await = Some(CliState {
            config: config.clone(),
            binary,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.state.write().await.take();
        let running: Vec<_> = self.running.lock().await.drain(..).collect();
        let count = running.iter().filter(|(task, _)| !task.is_finished()).count();

        // Each run loop kills and reaps its child once cancelled.
        for (_, canceller) in &running {
            canceller.cancel(STOP_REASON);
        }
        for (mut task, canceller) in running {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                tracing::warn!(
                    backend = %self.id,
                    task_id = %canceller.task_id(),
                    "CLI execution did not exit after stop, aborting"
                );
                // Dropping the child inside the task kills the process.
                task.abort();
            }
        }
        if count > 0 {
            tracing::info!(backend = %self.id, count, "Stopped active CLI executions");
        }
        Ok(())
    }

    async fn health_check(&self) -> BackendHealthReport {
        let state = self.state.read().await;
        let Some(state) = state.as_ref() else {
            return BackendHealthReport::unhealthy(&self.id, "not started");
        };

        let started = Instant::now();
        let probe = Command::new(&state.binary)
            .arg("--version")
            .env_clear()
            .envs(child_environment(
                &state.config.env_allowlist(),
                |key| std::env::var(key).ok(),
                &HashMap::new(),
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, probe).await {
            Ok(Ok(status)) if status.success() => {
                BackendHealthReport::healthy(&self.id, started.elapsed())
            }
            Ok(Ok(status)) => BackendHealthReport::degraded(
                &self.id,
                format!("version probe exited with {:?}", status.code()),
            ),
            Ok(Err(e)) => BackendHealthReport::unhealthy(&self.id, format!("probe failed: {e}")),
            Err(_) => BackendHealthReport::unhealthy(&self.id, "probe timed out"),
        }
    }

    async fn execute_task(&self, task: ExecutionTask) -> Result<ExecutionHandle, BackendError> {
        let state = self.state.read().await;
        let Some(state) = state.as_ref() else {
            return Err(BackendError::NotStarted {
                id: self.id.clone(),
            });
        };

        let child = self.spawn_child(state, &task)?;
        let (handle, sink) = handle::channel(task.id.clone());
        let prompt = render_prompt(&task);

        tracing::info!(
            backend = %self.id,
            task_id = %task.id,
            job_id = %task.job_id,
            pid = ?child.id(),
            "CLI execution started"
        );

        let canceller = sink.canceller();
        let join = tokio::spawn(Self::run(child, sink, prompt));
        let mut running = self.running.lock().await;
        running.retain(|(task, _)| !task.is_finished());
        running.push((join, canceller));

        Ok(handle)
    }

    fn capabilities(&self) -> BackendCapabilities {
        let context_window = self
            .state
            .try_read()
            .ok()
            .and_then(|s| s.as_ref().map(|s| s.config.context_window))
            .unwrap_or(0);
        BackendCapabilities {
            goal_types: vec![GoalType::Code, GoalType::Review, GoalType::Research],
            streaming: true,
            cancellation: true,
            file_edits: true,
            context_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_RUN_LIMIT: Duration = Duration::from_secs(10);
    use crate::backend::types::{ExecutionStatus, TaskInstruction};
    use uuid::Uuid;

    fn task() -> ExecutionTask {
        ExecutionTask::new(
            Uuid::new_v4(),
            "agent-1",
            TaskInstruction {
                prompt: "write code".into(),
                goal_type: GoalType::Code,
                target_files: vec![],
                prior_turns: vec![],
            },
        )
    }

    /// A backend whose "CLI" is `sh` running the given script body.
    async fn script_backend(body: &str) -> (CliBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-cli.sh");
        std::fs::write(&script, body).unwrap();

        let backend = CliBackend::new("cli");
        backend
            .start(&BackendConfig::Cli(CliBackendConfig {
                binary: "sh".to_string(),
                args: vec![script.display().to_string()],
                ..Default::default()
            }))
            .await
            .unwrap();
        (backend, dir)
    }

    #[test]
    fn parse_line_known_records() {
        assert_eq!(
            parse_line(r#"{"type":"text","text":"hello"}"#),
            ParsedLine::Event(OutputEvent::text("hello"))
        );
        assert_eq!(
            parse_line(r#"{"type":"file_change","path":"src/lib.rs","kind":"created"}"#),
            ParsedLine::Event(OutputEvent::FileChange {
                change: FileChange {
                    path: "src/lib.rs".into(),
                    kind: FileChangeKind::Created,
                }
            })
        );
        assert_eq!(
            parse_line(r#"{"type":"result","summary":"done"}"#),
            ParsedLine::Final {
                summary: "done".into(),
                is_error: false
            }
        );
    }

    #[test]
    fn parse_line_falls_back_to_text() {
        assert_eq!(
            parse_line("plain progress output"),
            ParsedLine::Event(OutputEvent::text("plain progress output"))
        );
        // Valid JSON with an unknown type is still just text.
        let raw = r#"{"type":"mystery","x":1}"#;
        assert_eq!(parse_line(raw), ParsedLine::Event(OutputEvent::text(raw)));
    }

    #[test]
    fn environment_is_allowlisted() {
        let host = |key: &str| match key {
            "PATH" => Some("/usr/bin".to_string()),
            "HOME" => Some("/home/agent".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("leak".to_string()),
            _ => None,
        };
        let mut overrides = HashMap::new();
        overrides.insert("PROJECT".to_string(), "demo".to_string());
        overrides.insert("HOME".to_string(), "/workspace".to_string());

        let env = child_environment(
            &["PATH".to_string(), "HOME".to_string(), "LANG".to_string()],
            host,
            &overrides,
        );
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/workspace"));
        assert_eq!(env.get("PROJECT").map(String::as_str), Some("demo"));
        assert!(!env.contains_key("AWS_SECRET_ACCESS_KEY"));
        assert!(!env.contains_key("LANG"));
    }

    #[test]
    fn render_prompt_includes_context() {
        let mut t = task();
        t.context.system_prompt = Some("You are careful.".into());
        t.context.memories = vec!["uses tabs".into()];
        t.instruction.target_files = vec!["src/main.rs".into()];
        let prompt = render_prompt(&t);
        assert!(prompt.starts_with("You are careful."));
        assert!(prompt.contains("- uses tabs"));
        assert!(prompt.contains("Target files: src/main.rs"));
        assert!(prompt.ends_with("write code"));
    }

    #[test]
    fn push_capped_respects_limit() {
        let mut buf = String::new();
        let long = "x".repeat(MAX_OUTPUT_SIZE + 10);
        push_capped(&mut buf, &long);
        assert_eq!(buf.len(), MAX_OUTPUT_SIZE);
        push_capped(&mut buf, "more");
        assert_eq!(buf.len(), MAX_OUTPUT_SIZE);
    }

    #[tokio::test]
    async fn start_fails_for_missing_binary() {
        let backend = CliBackend::new("cli");
        let err = backend
            .start(&BackendConfig::Cli(CliBackendConfig {
                binary: "definitely-not-a-real-cli-binary".into(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::BinaryNotFound { .. }));
    }

    #[tokio::test]
    async fn execute_before_start_fails() {
        let backend = CliBackend::new("cli");
        assert!(matches!(
            backend.execute_task(task()).await,
            Err(BackendError::NotStarted { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn structured_output_becomes_events_and_result() {
        let (backend, _dir) = script_backend(
            r#"
echo '{"type":"text","text":"working"}'
echo 'not json at all'
echo '{"type":"file_change","path":"a.rs","kind":"created"}'
echo '{"type":"usage","input_tokens":10,"output_tokens":4}'
echo '{"type":"result","summary":"Created 1 file"}'
exit 0
"#,
        )
        .await;

        let handle = backend.execute_task(task()).await.unwrap();
        let events = tokio::time::timeout(TEST_RUN_LIMIT, handle.events().unwrap().collect_all())
            .await
            .unwrap();

        assert_eq!(events[0], OutputEvent::text("working"));
        assert_eq!(events[1], OutputEvent::text("not json at all"));
        assert!(matches!(events[2], OutputEvent::FileChange { .. }));
        assert!(matches!(events[3], OutputEvent::Usage { .. }));
        assert!(events.last().unwrap().is_complete());

        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.summary, "Created 1 file");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.file_changes.len(), 1);
        assert_eq!(result.usage.total(), 14);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_permanent() {
        let (backend, _dir) = script_backend("echo 'bad flag' >&2\nexit 3\n").await;
        let handle = backend.execute_task(task()).await.unwrap();
        let result = tokio::time::timeout(TEST_RUN_LIMIT, handle.result())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        let error = result.error.unwrap();
        assert_eq!(error.classification, ErrorClassification::Permanent);
        assert!(error.message.contains("bad flag"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_process_is_resource() {
        let (backend, _dir) = script_backend("kill -9 $$\n").await;
        let handle = backend.execute_task(task()).await.unwrap();
        let result = tokio::time::timeout(TEST_RUN_LIMIT, handle.result())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(137));
        assert_eq!(
            result.classification(),
            Some(ErrorClassification::Resource)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn task_environment_reaches_child() {
        let (backend, _dir) =
            script_backend("echo \"{\\\"type\\\":\\\"result\\\",\\\"summary\\\":\\\"$PROJECT\\\"}\"\n")
                .await;
        let mut t = task();
        t.context
            .environment
            .insert("PROJECT".to_string(), "demo".to_string());
        let handle = backend.execute_task(t).await.unwrap();
        let result = tokio::time::timeout(TEST_RUN_LIMIT, handle.result())
            .await
            .unwrap();
        assert_eq!(result.summary, "demo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_kills_long_running_process() {
        let (backend, _dir) = script_backend("sleep 30\n").await;
        let handle = backend.execute_task(task()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.cancel("test");
        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_utf8_line_becomes_text_and_run_completes() {
        let (backend, _dir) = script_backend(
            r#"
printf 'bad \377 byte\n'
echo 'plain text'
echo '{"type":"result","summary":"Created 2 files"}'
"#,
        )
        .await;

        let handle = backend.execute_task(task()).await.unwrap();
        let events = tokio::time::timeout(TEST_RUN_LIMIT, handle.events().unwrap().collect_all())
            .await
            .unwrap();
        assert_eq!(events[0], OutputEvent::text("bad \u{FFFD} byte"));
        assert_eq!(events[1], OutputEvent::text("plain text"));
        assert!(events[2].is_complete());

        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.summary, "Created 2 files");
        assert_eq!(result.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_active_execution() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("child.pid");
        let (backend, _script_dir) =
            script_backend(&format!("echo $$ > {}\nexec sleep 30\n", pid_file.display())).await;

        let handle = backend.execute_task(task()).await.unwrap();
        let pid = tokio::time::timeout(TEST_RUN_LIMIT, async {
            loop {
                if let Ok(pid) = std::fs::read_to_string(&pid_file)
                    && !pid.trim().is_empty()
                {
                    return pid.trim().to_string();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        backend.stop().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .unwrap();
        assert_ne!(result.status, ExecutionStatus::Completed);
        assert!(result.summary.contains(STOP_REASON));

        let alive = std::process::Command::new("kill")
            .args(["-0", &pid])
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!alive.success(), "child {pid} still running after stop");
        assert!(matches!(
            backend.execute_task(task()).await,
            Err(BackendError::NotStarted { .. })
        ));
    }

    #[tokio::test]
    async fn start_rejects_foreign_config() {
        let backend = CliBackend::new("cli");
        let err = backend.start(&BackendConfig::Stub).await.unwrap_err();
        assert!(matches!(err, BackendError::Misconfigured { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn health_check_probes_binary() {
        let (backend, _dir) = script_backend("exit 0\n").await;
        let report = backend.health_check().await;
        // `sh --version` is not universal; any answer within the bound is fine.
        assert_eq!(report.backend_id, "cli");

        backend.stop().await.unwrap();
        let report = backend.health_check().await;
        assert_eq!(report.status, crate::backend::HealthStatus::Unhealthy);
    }
}
