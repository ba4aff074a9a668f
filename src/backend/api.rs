//! HTTP LLM backend running a bounded agentic tool loop.
//!
//! Each task is a conversation: send the messages, stream any text out as
//! events, run the requested tools, feed results back, and stop when the
//! model ends its turn or the turn budget runs out.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;

use super::handle::{self, Canceller, ExecutionHandle, HandleSink};
use super::types::{
    BackendCapabilities, BackendHealthReport, ErrorClassification, ExecutionError,
    ExecutionResult, ExecutionTask, GoalType, OutputEvent, TokenUsage,
};
use super::{BackendConfig, BackendKind, ExecutionBackend, HEALTH_CHECK_TIMEOUT, wrong_kind};
use crate::config::ApiBackendConfig;
use crate::error::{BackendError, LlmError};
use crate::llm::{self, ChatMessage, ContentBlock, LlmProvider, StopReason, TurnRequest};
use crate::tools::builtin::builtin_registry;
use crate::tools::{ToolContext, ToolRegistry};

struct ApiState {
    provider: Arc<dyn LlmProvider>,
    config: ApiBackendConfig,
}

/// Everything one execution needs, moved into its task.
struct Run {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    default_max_tokens: u32,
    task: ExecutionTask,
    sink: HandleSink,
}

pub struct ApiBackend {
    id: String,
    provider_override: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    state: RwLock<Option<ApiState>>,
    running: Mutex<Vec<(JoinHandle<()>, Canceller)>>,
}

/// Text deltas buffered between the provider and the event sink.
const DELTA_BUFFER: usize = 64;

impl ApiBackend {
    /// Backend that builds its provider from config at `start`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_override: None,
            tools: Arc::new(builtin_registry()),
            state: RwLock::new(None),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Use this provider instead of building one from config.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider_override = Some(provider);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }
}

/// System prompt: caller's prompt plus memories and preloaded files.
fn system_prompt(task: &ExecutionTask) -> Option<String> {
    let ctx = &task.context;
    let mut sections = Vec::new();
    if let Some(system) = &ctx.system_prompt {
        sections.push(system.clone());
    }
    if !ctx.memories.is_empty() {
        let list: Vec<String> = ctx.memories.iter().map(|m| format!("- {m}")).collect();
        sections.push(format!("Relevant memories:\n{}", list.join("\n")));
    }
    for file in &ctx.preloaded_files {
        sections.push(format!(
            "<file path=\"{}\">\n{}\n</file>",
            file.path, file.content
        ));
    }
    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

/// Opening conversation: prior turns, then the instruction.
fn initial_messages(task: &ExecutionTask) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = task
        .instruction
        .prior_turns
        .iter()
        .map(|turn| match turn.role.as_str() {
            "assistant" => ChatMessage::assistant(&turn.content),
            _ => ChatMessage::user(&turn.content),
        })
        .collect();

    let mut prompt = task.instruction.prompt.clone();
    if !task.instruction.target_files.is_empty() {
        prompt.push_str(&format!(
            "\n\nTarget files: {}",
            task.instruction.target_files.join(", ")
        ));
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

impl Run {
    async fn execute(self) {
        let Run {
            provider,
            tools,
            default_max_tokens,
            task,
            sink,
        } = self;
        let started = Instant::now();
        let constraints = &task.constraints;

        let tool_ctx = ToolContext {
            task_id: task.id.clone(),
            job_id: task.job_id,
            workspace: task.context.workspace.clone(),
            allow_shell: constraints.allow_shell,
            allow_network: constraints.allow_network,
        };
        let definitions = tools.tool_definitions_for(constraints).await;
        let system = system_prompt(&task);
        let max_tokens = constraints.max_tokens.unwrap_or(default_max_tokens);

        let mut messages = initial_messages(&task);
        let mut usage = TokenUsage::default();
        let mut file_changes = Vec::new();
        let mut produced_output = false;

        for turn in 1..=constraints.max_turns {
            let request = TurnRequest::new(messages.clone(), max_tokens)
                .with_system(system.clone())
                .with_tools(definitions.clone())
                .with_model(constraints.model.clone());

            let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_BUFFER);
            let turn_future = provider.stream_turn(request, delta_tx);
            tokio::pin!(turn_future);
            let response = loop {
                tokio::select! {
                    biased;
                    _ = sink.cancelled() => return,
                    Some(delta) = delta_rx.recv() => {
                        produced_output = true;
                        if !sink.emit(OutputEvent::text(delta)).await {
                            return;
                        }
                    }
                    response = &mut turn_future => break response,
                }
            };
            // The provider may finish before its last deltas were forwarded.
            while let Ok(delta) = delta_rx.try_recv() {
                produced_output = true;
                if !sink.emit(OutputEvent::text(delta)).await {
                    return;
                }
            }
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, turn, "LLM turn failed: {}", e);
                    let error = turn_error(&e).partial(produced_output);
                    let mut result =
                        ExecutionResult::failed(&task.id, error).with_duration(started.elapsed());
                    result.usage = usage;
                    result.file_changes = file_changes;
                    sink.finish(result).await;
                    return;
                }
            };

            usage.add(response.usage);
            if !sink
                .emit(OutputEvent::Usage {
                    usage: response.usage,
                })
                .await
            {
                return;
            }
            let failure = match response.stop_reason {
                StopReason::ToolUse if !response.tool_calls.is_empty() => None,
                StopReason::EndTurn => {
                    tracing::debug!(task_id = %task.id, turns = turn, "Agentic loop finished");
                    let mut result = ExecutionResult::completed(&task.id, response.text)
                        .with_duration(started.elapsed());
                    result.usage = usage;
                    result.file_changes = file_changes;
                    sink.finish(result).await;
                    return;
                }
                StopReason::ToolUse => Some(
                    ExecutionError::new(
                        "Model stopped for tool use without requesting a tool",
                        ErrorClassification::Permanent,
                    )
                    .with_code("empty_tool_use")
                    .partial(produced_output),
                ),
                StopReason::MaxTokens => Some(
                    ExecutionError::new(
                        format!("Model output truncated at the {max_tokens} token limit"),
                        ErrorClassification::Permanent,
                    )
                    .with_code("max_tokens")
                    .partial(true),
                ),
                StopReason::Other => Some(
                    ExecutionError::new(
                        "Model stopped for an unrecognized reason",
                        ErrorClassification::Permanent,
                    )
                    .with_code("unexpected_stop")
                    .partial(produced_output),
                ),
            };
            if let Some(error) = failure {
                tracing::warn!(
                    task_id = %task.id,
                    turn,
                    stop_reason = ?response.stop_reason,
                    "LLM turn ended abnormally"
                );
                let mut result =
                    ExecutionResult::failed(&task.id, error).with_duration(started.elapsed());
                result.usage = usage;
                result.file_changes = file_changes;
                sink.finish(result).await;
                return;
            }

            messages.push(ChatMessage::assistant_tool_calls(
                &response.text,
                &response.tool_calls,
            ));

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in response.tool_calls {
                produced_output = true;
                if !sink
                    .emit(OutputEvent::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    })
                    .await
                {
                    return;
                }

                let outcome = tokio::select! {
                    _ = sink.cancelled() => return,
                    outcome = tools.execute(&call.name, call.arguments, constraints, &tool_ctx) => outcome,
                };
                let (output, is_error) = match outcome {
                    Ok(out) => {
                        for change in &out.file_changes {
                            if !sink
                                .emit(OutputEvent::FileChange {
                                    change: change.clone(),
                                })
                                .await
                            {
                                return;
                            }
                        }
                        file_changes.extend(out.file_changes.iter().cloned());
                        (out.to_model_text(), false)
                    }
                    Err(e) => {
                        tracing::debug!(task_id = %task.id, tool = %call.name, "Tool failed: {}", e);
                        (e.to_string(), true)
                    }
                };

                if !sink
                    .emit(OutputEvent::ToolResult {
                        id: call.id.clone(),
                        output: output.clone(),
                        is_error,
                    })
                    .await
                {
                    return;
                }
                results.push(ContentBlock::ToolResult {
                    tool_use_id: call.id,
                    content: output,
                    is_error,
                });
            }
            messages.push(ChatMessage::tool_results(results));
        }

        let error = ExecutionError::new(
            format!("Turn limit of {} reached", constraints.max_turns),
            ErrorClassification::Permanent,
        )
        .with_code("max_turns")
        .partial(produced_output);
        let mut result = ExecutionResult::failed(&task.id, error).with_duration(started.elapsed());
        result.usage = usage;
        result.file_changes = file_changes;
        sink.finish(result).await;
    }
}

fn turn_error(e: &LlmError) -> ExecutionError {
    let error = ExecutionError::new(e.to_string(), e.classification());
    match e {
        LlmError::RateLimited { .. } => error.with_code("rate_limited"),
        LlmError::AuthFailed { .. } => error.with_code("auth_failed"),
        LlmError::ContextLengthExceeded { .. } => error.with_code("context_length"),
        _ => error,
    }
}

#[async_trait]
impl ExecutionBackend for ApiBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Api
    }

    async fn start(&self, config: &BackendConfig) -> Result<(), BackendError> {
        let BackendConfig::Api(config) = config else {
            return Err(wrong_kind(&self.id, BackendKind::Api, config));
        };

        let provider = match &self.provider_override {
            Some(provider) => Arc::clone(provider),
            None => llm::create_provider(config).map_err(|e| BackendError::Misconfigured {
                id: self.id.clone(),
                reason: match e {
                    LlmError::AuthFailed { .. } => "missing API key".to_string(),
                    other => other.to_string(),
                },
            })?,
        };

        tracing::info!(
            backend = %self.id,
            provider = provider.name(),
            model = provider.model_name(),
            "API backend started"
        );
        *self.state.write().await = Some(ApiState {
            provider,
            config: config.clone(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.state.write().await.take();
        let running: Vec<_> = self.running.lock().await.drain(..).collect();
        for (_, canceller) in &running {
            canceller.cancel("backend stopped");
        }
        // Run loops return as soon as they observe the cancel.
        for (task, _) in running {
            let _ = task.await;
        }
        Ok(())
    }

    async fn health_check(&self) -> BackendHealthReport {
        let provider = match self.state.read().await.as_ref() {
            Some(state) => Arc::clone(&state.provider),
            None => return BackendHealthReport::unhealthy(&self.id, "not started"),
        };

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, provider.health_check()).await {
            Ok(Ok(latency)) => BackendHealthReport::healthy(&self.id, latency),
            Ok(Err(e @ LlmError::RateLimited { .. })) => {
                BackendHealthReport::degraded(&self.id, e.to_string())
            }
            Ok(Err(e)) => BackendHealthReport::unhealthy(&self.id, e.to_string()),
            Err(_) => BackendHealthReport::unhealthy(&self.id, "probe timed out"),
        }
    }

    async fn execute_task(&self, task: ExecutionTask) -> Result<ExecutionHandle, BackendError> {
        let (provider, default_max_tokens) = match self.state.read().await.as_ref() {
            Some(state) => (Arc::clone(&state.provider), state.config.max_tokens),
            None => {
                return Err(BackendError::NotStarted {
                    id: self.id.clone(),
                });
            }
        };

        let (handle, sink) = handle::channel(task.id.clone());
        tracing::info!(
            backend = %self.id,
            task_id = %task.id,
            job_id = %task.job_id,
            max_turns = task.constraints.max_turns,
            "API execution started"
        );

        let run = Run {
            provider,
            tools: Arc::clone(&self.tools),
            default_max_tokens,
            task,
            sink,
        };
        let canceller = run.sink.canceller();
        let join = tokio::spawn(run.execute());
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
            goal_types: vec![
                GoalType::Code,
                GoalType::Review,
                GoalType::Research,
                GoalType::Chat,
            ],
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
    use crate::backend::types::{ExecutionStatus, FileChangeKind, TaskConstraints, TaskContext};
    use crate::backend::types::{PriorTurn, TaskInstruction};
    use crate::llm::{StopReason, ToolCall, TurnResponse};
    use std::collections::VecDeque;
    use std::time::Duration;
    use uuid::Uuid;

    /// Provider that replays canned turns and hangs once they run out.
    struct ScriptedProvider {
        turns: std::sync::Mutex<VecDeque<Result<TurnResponse, LlmError>>>,
        requests: std::sync::Mutex<Vec<TurnRequest>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Result<TurnResponse, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                turns: std::sync::Mutex::new(turns.into()),
                requests: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<TurnRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted-model"
        }

        async fn complete_turn(&self, request: TurnRequest) -> Result<TurnResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            let next = self.turns.lock().unwrap().pop_front();
            match next {
                Some(turn) => turn,
                None => std::future::pending().await,
            }
        }

        async fn health_check(&self) -> Result<Duration, LlmError> {
            Ok(Duration::from_millis(1))
        }
    }

    fn text_turn(text: &str) -> Result<TurnResponse, LlmError> {
        Ok(TurnResponse {
            text: text.to_string(),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }

    fn tool_turn(name: &str, args: serde_json::Value) -> Result<TurnResponse, LlmError> {
        Ok(TurnResponse {
            text: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("tu_{name}"),
                name: name.to_string(),
                arguments: args,
            }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 8,
                output_tokens: 3,
            },
        })
    }

    fn task(workspace: Option<&std::path::Path>) -> ExecutionTask {
        ExecutionTask::new(
            Uuid::new_v4(),
            "agent-1",
            TaskInstruction {
                prompt: "create hello.txt".into(),
                goal_type: GoalType::Code,
                target_files: vec![],
                prior_turns: vec![],
            },
        )
        .with_context(TaskContext {
            workspace: workspace.map(|p| p.to_path_buf()),
            ..Default::default()
        })
    }

    async fn backend(provider: Arc<ScriptedProvider>) -> ApiBackend {
        let backend = ApiBackend::new("api").with_provider(provider);
        backend
            .start(&BackendConfig::Api(ApiBackendConfig::default()))
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn start_without_key_fails() {
        let backend = ApiBackend::new("api");
        let err = backend
            .start(&BackendConfig::Api(ApiBackendConfig::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Misconfigured { .. }));
        assert!(err.to_string().contains("missing API key"));
    }

    #[tokio::test]
    async fn text_only_turn_completes() {
        let provider = ScriptedProvider::new(vec![text_turn("All done.")]);
        let backend = backend(provider.clone()).await;

        let handle = backend.execute_task(task(None)).await.unwrap();
        let events = handle.events().unwrap().collect_all().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(kinds, vec!["text", "usage", "complete"]);

        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.summary, "All done.");
        assert_eq!(result.usage.total(), 15);
    }

    #[tokio::test]
    async fn tool_loop_writes_files_and_feeds_results_back() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            tool_turn(
                "write_file",
                serde_json::json!({"path": "hello.txt", "content": "hi"}),
            ),
            text_turn("Created hello.txt"),
        ]);
        let backend = backend(provider.clone()).await;

        let handle = backend.execute_task(task(Some(dir.path()))).await.unwrap();
        let events = handle.events().unwrap().collect_all().await;
        let kinds: Vec<&str> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(
            kinds,
            vec![
                "usage",
                "tool_use",
                "file_change",
                "tool_result",
                "text",
                "usage",
                "complete"
            ]
        );

        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.file_changes.len(), 1);
        assert_eq!(result.file_changes[0].kind, FileChangeKind::Created);
        assert_eq!(result.usage.total(), 26);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "hi"
        );

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let last = requests[1].messages.last().unwrap();
        assert!(matches!(
            &last.content[0],
            ContentBlock::ToolResult { is_error: false, .. }
        ));
    }

    #[tokio::test]
    async fn denied_tool_is_hidden_and_refused() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![
            tool_turn(
                "write_file",
                serde_json::json!({"path": "x.txt", "content": "x"}),
            ),
            text_turn("Could not write"),
        ]);
        let backend = backend(provider.clone()).await;

        let t = task(Some(dir.path())).with_constraints(TaskConstraints {
            denied_tools: vec!["write_file".into()],
            ..Default::default()
        });
        let handle = backend.execute_task(t).await.unwrap();
        let events = handle.events().unwrap().collect_all().await;

        assert!(events.iter().any(|e| matches!(
            e,
            OutputEvent::ToolResult { is_error: true, .. }
        )));
        assert!(!dir.path().join("x.txt").exists());

        let offered: Vec<String> = provider.requests()[0]
            .tools
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert!(!offered.contains(&"write_file".to_string()));
        assert!(offered.contains(&"read_file".to_string()));
    }

    #[tokio::test]
    async fn transport_failure_after_output_is_partial_transient() {
        let provider = ScriptedProvider::new(vec![
            Ok(TurnResponse {
                text: "Starting".into(),
                tool_calls: vec![ToolCall {
                    id: "tu_1".into(),
                    name: "list_dir".into(),
                    arguments: serde_json::json!({}),
                }],
                stop_reason: StopReason::ToolUse,
                usage: TokenUsage::default(),
            }),
            Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "connection reset".into(),
            }),
        ]);
        let backend = backend(provider).await;

        let handle = backend.execute_task(task(None)).await.unwrap();
        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.classification, ErrorClassification::Transient);
        assert!(error.partial_execution);
    }

    #[tokio::test]
    async fn turn_budget_is_enforced() {
        let provider = ScriptedProvider::new(vec![
            tool_turn("list_dir", serde_json::json!({})),
            tool_turn("list_dir", serde_json::json!({})),
            text_turn("never reached"),
        ]);
        let backend = backend(provider.clone()).await;

        let t = task(None).with_constraints(TaskConstraints {
            max_turns: 2,
            ..Default::default()
        });
        let handle = backend.execute_task(t).await.unwrap();
        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.classification(), Some(ErrorClassification::Permanent));
        assert_eq!(provider.requests().len(), 2);
    }

    #[tokio::test]
    async fn prior_turns_and_system_prompt_are_sent() {
        let provider = ScriptedProvider::new(vec![text_turn("ok")]);
        let backend = backend(provider.clone()).await;

        let mut t = task(None);
        t.instruction.prior_turns = vec![
            PriorTurn {
                role: "user".into(),
                content: "earlier question".into(),
            },
            PriorTurn {
                role: "assistant".into(),
                content: "earlier answer".into(),
            },
        ];
        t.context.system_prompt = Some("Be terse.".into());
        t.context.memories = vec!["prefers rust".into()];

        backend.execute_task(t).await.unwrap().result().await;
        let request = &provider.requests()[0];
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[1].role, crate::llm::Role::Assistant);
        let system = request.system.as_deref().unwrap();
        assert!(system.starts_with("Be terse."));
        assert!(system.contains("- prefers rust"));
    }

    #[tokio::test]
    async fn cancel_interrupts_pending_turn() {
        let provider = ScriptedProvider::new(vec![]);
        let backend = backend(provider).await;

        let handle = backend.execute_task(task(None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel("user requested");

        let result = tokio::time::timeout(Duration::from_secs(1), handle.result())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
    }

    fn stopped_turn(text: &str, stop_reason: StopReason) -> Result<TurnResponse, LlmError> {
        Ok(TurnResponse {
            text: text.to_string(),
            tool_calls: vec![],
            stop_reason,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 4096,
            },
        })
    }

    #[tokio::test]
    async fn max_tokens_turn_fails_with_partial_output() {
        let provider = ScriptedProvider::new(vec![stopped_turn(
            "I will now write the fi",
            StopReason::MaxTokens,
        )]);
        let backend = backend(provider).await;

        let handle = backend.execute_task(task(None)).await.unwrap();
        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_ne!(result.summary, "I will now write the fi");
        let error = result.error.unwrap();
        assert_eq!(error.code.as_deref(), Some("max_tokens"));
        assert_eq!(error.classification, ErrorClassification::Permanent);
        assert!(error.partial_execution);
    }

    #[tokio::test]
    async fn unrecognized_stop_reason_fails() {
        let provider = ScriptedProvider::new(vec![stopped_turn("", StopReason::Other)]);
        let backend = backend(provider).await;

        let result = backend.execute_task(task(None)).await.unwrap().result().await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code.as_deref(), Some("unexpected_stop"));
        assert!(!error.partial_execution);
    }

    #[tokio::test]
    async fn tool_use_stop_without_calls_fails() {
        let provider = ScriptedProvider::new(vec![stopped_turn("hmm", StopReason::ToolUse)]);
        let backend = backend(provider.clone()).await;

        let result = backend.execute_task(task(None)).await.unwrap().result().await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(
            result.error.unwrap().code.as_deref(),
            Some("empty_tool_use")
        );
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn streamed_deltas_become_text_events() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9,\"output_tokens\":1}}}\n\n",
                "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\", world\"}}\n\n",
                "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
                "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
                "data: {\"type\":\"message_stop\"}\n\n",
            ))
            .create_async()
            .await;

        let provider = llm::AnthropicProvider::new(
            secrecy::SecretString::from("test-key"),
            "claude-test",
            server.url(),
            Duration::from_secs(5),
        )
        .unwrap();
        let backend = ApiBackend::new("api").with_provider(Arc::new(provider));
        backend
            .start(&BackendConfig::Api(ApiBackendConfig::default()))
            .await
            .unwrap();

        let handle = backend.execute_task(task(None)).await.unwrap();
        let events = tokio::time::timeout(
            Duration::from_secs(5),
            handle.events().unwrap().collect_all(),
        )
        .await
        .unwrap();
        let texts: Vec<&OutputEvent> = events
            .iter()
            .filter(|e| matches!(e, OutputEvent::Text { .. }))
            .collect();
        assert_eq!(
            texts,
            vec![&OutputEvent::text("Hello"), &OutputEvent::text(", world")]
        );

        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.summary, "Hello, world");
        assert_eq!(result.usage.total(), 12);
    }

    #[tokio::test]
    async fn stop_cancels_pending_turn() {
        let provider = ScriptedProvider::new(vec![]);
        let backend = backend(provider).await;

        let handle = backend.execute_task(task(None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.stop().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.summary.contains("backend stopped"));
        assert!(matches!(
            backend.execute_task(task(None)).await,
            Err(BackendError::NotStarted { .. })
        ));
    }

    #[tokio::test]
    async fn start_rejects_foreign_config() {
        let backend = ApiBackend::new("api");
        let err = backend.start(&BackendConfig::Stub).await.unwrap_err();
        assert!(matches!(err, BackendError::Misconfigured { .. }));
    }

    #[tokio::test]
    async fn health_reflects_provider() {
        let backend = backend(ScriptedProvider::new(vec![])).await;
        let report = backend.health_check().await;
        assert_eq!(report.status, crate::backend::HealthStatus::Healthy);
    }
}
