//! One running tool-calling loop bound to one conversation.
//!
//! A session is started once. Its loop runs on its own task and feeds an
//! event stream; whatever ends the loop (final answer, step limit, model
//! error, cancellation), the completion handler persists the assistant
//! message with its stop reason and usage, then runs the disposal callback.

use crate::store::{ChatStore, MessageOutcome, StoredMessage, TokenUsage};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use nao_llm::{
    ChatMessage, LlmConfig, ModelBackend, Reasoning, StreamChunk, ToolCall, ToolDefinition, Usage,
};
use nao_tools::{ToolCatalog, ToolContext};
use serde::Serialize;
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const STOP_REASON_COMPLETED: &str = "completed";
pub const STOP_REASON_INTERRUPTED: &str = "interrupted";
pub const STOP_REASON_ERROR: &str = "error";
pub const STOP_REASON_MAX_STEPS: &str = "max_steps";

/// Joins the text of consecutive model steps in the stored answer.
const STEP_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Streaming,
    Finishing,
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    NewChat {
        chat_id: String,
        title: String,
        created_at: DateTime<Utc>,
    },
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolCallStarted {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallFinished {
        id: String,
        name: String,
        output: serde_json::Value,
        is_error: bool,
    },
    Error {
        message: String,
    },
    Finish {
        stop_reason: String,
        usage: TokenUsage,
    },
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::NewChat { .. } => "new_chat",
            SessionEvent::TextDelta { .. } => "text_delta",
            SessionEvent::ReasoningDelta { .. } => "reasoning_delta",
            SessionEvent::ToolCallStarted { .. } => "tool_call_started",
            SessionEvent::ToolCallFinished { .. } => "tool_call_finished",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Finish { .. } => "finish",
        }
    }
}

pub type SessionStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// Collaborators shared by every session.
pub struct SessionEnv {
    pub store: Arc<dyn ChatStore>,
    pub catalog: Arc<ToolCatalog>,
    pub tool_ctx: ToolContext,
    pub system_prompt: String,
    pub max_steps: usize,
}

pub(crate) type DisposeFn = Box<dyn FnOnce() + Send>;

pub struct Session {
    chat_id: String,
    serial: u64,
    config: LlmConfig,
    backend: Arc<dyn ModelBackend>,
    env: Arc<SessionEnv>,
    cancel: CancellationToken,
    cancelled: AtomicBool,
    started: AtomicBool,
    state: watch::Sender<SessionState>,
    on_dispose: Mutex<Option<DisposeFn>>,
}

/// Output of the current request: new history entries, visible text, usage.
#[derive(Default)]
struct Turn {
    messages: Vec<ChatMessage>,
    text: String,
    usage: Usage,
}

struct LoopEnd {
    stop_reason: String,
    error: Option<String>,
}

impl LoopEnd {
    fn stopped(reason: impl Into<String>) -> Self {
        Self {
            stop_reason: reason.into(),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            stop_reason: STOP_REASON_ERROR.to_string(),
            error: Some(error),
        }
    }
}

enum StepEnd {
    Finished,
    Interrupted,
    Failed(String),
}

struct ModelStep {
    message: ChatMessage,
    finish_reason: String,
    end: StepEnd,
}

impl Session {
    pub(crate) fn new(
        chat_id: String,
        serial: u64,
        config: LlmConfig,
        backend: Arc<dyn ModelBackend>,
        env: Arc<SessionEnv>,
        cancel: CancellationToken,
        on_dispose: DisposeFn,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            chat_id,
            serial,
            config,
            backend,
            env,
            cancel,
            cancelled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            state,
            on_dispose: Mutex::new(Some(on_dispose)),
        }
    }

    /// Monotonic per registry; a later `create` always has a larger serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// True once `stop` was called or the owning scope was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.cancel.is_cancelled()
    }

    /// Signals cancellation and returns immediately.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Spawns the loop over `history` and returns its single-pass event stream.
    pub fn start(self: &Arc<Self>, history: Vec<ChatMessage>) -> anyhow::Result<SessionStream> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(anyhow::anyhow!(
                "session for chat {} was already started",
                self.chat_id
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let session = self.clone();
        tokio::spawn(async move {
            session.run(history, tx).await;
        });
        Ok(Box::pin(futures_util::stream::unfold(
            rx,
            |mut rx| async move { rx.recv().await.map(|event| (event, rx)) },
        )))
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %self.chat_id, serial = self.serial, model = %self.config.model))]
    async fn run(self: Arc<Self>, history: Vec<ChatMessage>, tx: mpsc::UnboundedSender<SessionEvent>) {
        let started = Instant::now();
        self.state.send_replace(SessionState::Streaming);
        tracing::info!(
            provider = %self.config.provider,
            history_messages = history.len(),
            "session started"
        );

        let mut turn = Turn::default();
        let end = self.drive(history, &mut turn, &tx).await;

        self.state.send_replace(SessionState::Finishing);
        self.complete(turn, end, &tx).await;
        self.dispose().await;
        tracing::info!(
            latency_ms = started.elapsed().as_millis() as u64,
            "session disposed"
        );
    }

    async fn drive(
        &self,
        history: Vec<ChatMessage>,
        turn: &mut Turn,
        tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> LoopEnd {
        let tools = self.env.catalog.llm_definitions().await;
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.env.system_prompt.clone()));
        messages.extend(history);

        for step in 1..=self.env.max_steps {
            if self.is_cancelled() {
                return LoopEnd::stopped(STOP_REASON_INTERRUPTED);
            }
            tracing::debug!(step, prompt_messages = messages.len(), "session model step");

            let ModelStep {
                message,
                finish_reason,
                end,
            } = self.model_step(&messages, &tools, turn, tx).await;

            match end {
                StepEnd::Finished => {}
                StepEnd::Interrupted => {
                    keep_partial(turn, message);
                    return LoopEnd::stopped(STOP_REASON_INTERRUPTED);
                }
                StepEnd::Failed(error) => {
                    keep_partial(turn, message);
                    return LoopEnd::failed(error);
                }
            }

            let calls = message.tool_calls.clone();
            messages.push(message.clone());
            turn.messages.push(message);
            if calls.is_empty() {
                return LoopEnd::stopped(stop_reason_for(&finish_reason));
            }

            // All results of one model turn are needed before the next one.
            let results = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // Every persisted tool call needs a result or the next request is rejected.
                    for call in &calls {
                        let output = json!({ "error": "interrupted" });
                        turn.messages
                            .push(ChatMessage::tool_result(call.id.clone(), output.to_string()));
                    }
                    return LoopEnd::stopped(STOP_REASON_INTERRUPTED);
                }
                results = futures_util::future::join_all(
                    calls.iter().map(|call| self.run_tool(call, tx)),
                ) => results,
            };
            for (call, content) in calls.iter().zip(results) {
                let result = ChatMessage::tool_result(call.id.clone(), content);
                messages.push(result.clone());
                turn.messages.push(result);
            }
        }

        tracing::warn!(max_steps = self.env.max_steps, "session step limit reached");
        LoopEnd::stopped(STOP_REASON_MAX_STEPS)
    }

    async fn model_step(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        turn: &mut Turn,
        tx: &mpsc::UnboundedSender<SessionEvent>,
    ) -> ModelStep {
        let mut step = ModelStep {
            message: ChatMessage::assistant(""),
            finish_reason: String::new(),
            end: StepEnd::Finished,
        };

        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                step.end = StepEnd::Interrupted;
                return step;
            }
            opened = self.backend.stream(messages, tools) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "model request failed");
                step.end = StepEnd::Failed(e.to_string());
                return step;
            }
        };

        let mut reasoning = Reasoning {
            text: String::new(),
            signature: None,
        };
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    step.end = StepEnd::Interrupted;
                    break;
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            match chunk {
                Ok(StreamChunk::Delta { content }) => {
                    if !content.is_empty() && step.message.content.is_empty() && !turn.text.is_empty() {
                        turn.text.push_str(STEP_SEPARATOR);
                    }
                    step.message.content.push_str(&content);
                    turn.text.push_str(&content);
                    emit(tx, SessionEvent::TextDelta { text: content });
                }
                Ok(StreamChunk::ReasoningDelta { content }) => {
                    reasoning.text.push_str(&content);
                    emit(tx, SessionEvent::ReasoningDelta { text: content });
                }
                Ok(StreamChunk::ReasoningSignature { signature }) => {
                    reasoning.signature = Some(signature);
                }
                Ok(StreamChunk::ToolCallStart { id, name }) => {
                    step.message.tool_calls.push(ToolCall {
                        id,
                        name,
                        arguments: String::new(),
                    });
                }
                Ok(StreamChunk::ToolCallDelta { arguments }) => {
                    if let Some(last) = step.message.tool_calls.last_mut() {
                        last.arguments.push_str(&arguments);
                    }
                }
                Ok(StreamChunk::Done {
                    usage,
                    finish_reason,
                }) => {
                    turn.usage.add(&usage);
                    step.finish_reason = finish_reason;
                }
                Err(e) => {
                    tracing::error!(error = %e, "model stream failed");
                    step.end = StepEnd::Failed(e.to_string());
                    break;
                }
            }
        }
        // Dropping the stream aborts the HTTP request.
        drop(stream);

        if !reasoning.text.is_empty() || reasoning.signature.is_some() {
            step.message.reasoning = Some(reasoning);
        }
        step
    }

    /// Runs one tool call; failures become an `{"error": ...}` result for the model.
    async fn run_tool(&self, call: &ToolCall, tx: &mpsc::UnboundedSender<SessionEvent>) -> String {
        let parsed = if call.arguments.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<serde_json::Value>(&call.arguments)
        };
        let args = match parsed {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(tool_call_id = %call.id, tool_name = %call.name, error = %e, "tool arguments are not valid JSON");
                let output = json!({ "error": format!("invalid JSON arguments for {}: {e}", call.name) });
                emit(
                    tx,
                    SessionEvent::ToolCallStarted {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: serde_json::Value::String(call.arguments.clone()),
                    },
                );
                emit(
                    tx,
                    SessionEvent::ToolCallFinished {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        output: output.clone(),
                        is_error: true,
                    },
                );
                return output.to_string();
            }
        };

        emit(
            tx,
            SessionEvent::ToolCallStarted {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: args.clone(),
            },
        );
        let started = Instant::now();
        let (output, is_error) = match self
            .env
            .catalog
            .call(&call.name, args, &self.env.tool_ctx)
            .await
        {
            Ok(output) => (output, false),
            Err(e) => (json!({ "error": e.to_string() }), true),
        };
        let content = output.to_string();
        tracing::info!(
            tool_call_id = %call.id,
            tool_name = %call.name,
            latency_ms = started.elapsed().as_millis() as u64,
            output_len = content.len(),
            is_error,
            "tool call executed"
        );
        emit(
            tx,
            SessionEvent::ToolCallFinished {
                id: call.id.clone(),
                name: call.name.clone(),
                output,
                is_error,
            },
        );
        content
    }

    async fn complete(&self, turn: Turn, end: LoopEnd, tx: &mpsc::UnboundedSender<SessionEvent>) {
        let usage = TokenUsage::from(&turn.usage);
        tracing::info!(
            stop_reason = %end.stop_reason,
            error = ?end.error,
            text_len = turn.text.len(),
            turn_messages = turn.messages.len(),
            total_tokens = usage.total_tokens,
            "session finishing"
        );
        if let Some(error) = end.error.as_ref() {
            emit(
                tx,
                SessionEvent::Error {
                    message: error.clone(),
                },
            );
        }

        let message = StoredMessage::assistant(turn.text, turn.messages);
        let outcome = MessageOutcome {
            stop_reason: Some(end.stop_reason.clone()),
            error: end.error,
            token_usage: Some(usage.clone()),
        };
        if let Err(e) = self
            .env
            .store
            .upsert_message(&self.chat_id, message, outcome)
            .await
        {
            tracing::error!(error = %e, "failed to persist assistant message");
        }

        emit(
            tx,
            SessionEvent::Finish {
                stop_reason: end.stop_reason,
                usage,
            },
        );
    }

    async fn dispose(&self) {
        let callback = self.on_dispose.lock().await.take();
        if let Some(callback) = callback {
            callback();
        }
        self.state.send_replace(SessionState::Disposed);
    }
}

/// Keeps the visible part of an unfinished step; its tool calls never ran.
fn keep_partial(turn: &mut Turn, mut message: ChatMessage) {
    message.tool_calls.clear();
    if !message.content.is_empty() {
        turn.messages.push(message);
    }
}

fn stop_reason_for(finish_reason: &str) -> String {
    match finish_reason {
        "" | "end_turn" | "stop" | "tool_use" | "tool_calls" | "stop_sequence" => {
            STOP_REASON_COMPLETED.to_string()
        }
        other => other.to_string(),
    }
}

fn emit(tx: &mpsc::UnboundedSender<SessionEvent>, event: SessionEvent) {
    // A gone consumer does not stop the loop; the result is still persisted.
    let _ = tx.send(event);
}
