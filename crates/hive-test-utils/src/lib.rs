//! Mocks and fixtures shared by the Hive test suites.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};

use hive_core::error::{HiveError, ProviderErrorKind, Result};
use hive_core::tool::{FunctionTool, ToolResult};
use hive_core::traits::ModelClient;
use hive_core::types::*;

/// One scripted reply from [`MockModelClient`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Message(Message),
    Error(ProviderErrorKind, String),
    /// Raw delta script for streaming requests.
    Stream(Vec<StreamDelta>),
}

#[derive(Debug, Clone)]
enum Fallback {
    Echo,
    Fail(ProviderErrorKind, String),
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Model client driven by a queue of scripted replies.
///
/// Every request is recorded. When the queue runs dry the client either
/// echoes the last user message or fails, depending on configuration.
#[derive(Debug)]
pub struct MockModelClient {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    failing_models: Mutex<HashMap<String, (ProviderErrorKind, String)>>,
    fallback: Mutex<Fallback>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl Default for MockModelClient {
    fn default() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            failing_models: Mutex::new(HashMap::new()),
            fallback: Mutex::new(Fallback::Echo),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl MockModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering every request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: MockReply) -> &Self {
        lock(&self.replies).push_back(reply);
        self
    }

    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.push(MockReply::Message(Message::assistant(text)))
    }

    pub fn push_tool_call(&self, id: &str, name: &str, arguments: serde_json::Value) -> &Self {
        self.push_tool_calls(vec![ToolCall::new(id, name, arguments.to_string())])
    }

    pub fn push_tool_calls(&self, calls: Vec<ToolCall>) -> &Self {
        self.push(MockReply::Message(Message::assistant_with_calls("", calls)))
    }

    pub fn push_error(&self, kind: ProviderErrorKind, message: &str) -> &Self {
        self.push(MockReply::Error(kind, message.to_string()))
    }

    pub fn push_stream(&self, deltas: Vec<StreamDelta>) -> &Self {
        self.push(MockReply::Stream(deltas))
    }

    /// Fail every request once the queue is empty.
    pub fn always_fail(&self, kind: ProviderErrorKind, message: &str) -> &Self {
        *lock(&self.fallback) = Fallback::Fail(kind, message.to_string());
        self
    }

    /// Fail every request addressed to `model`, regardless of the queue.
    pub fn fail_for_model(&self, model: &str, kind: ProviderErrorKind, message: &str) -> &Self {
        lock(&self.failing_models).insert(model.to_string(), (kind, message.to_string()));
        self
    }

    /// Number of requests received so far.
    pub fn attempts(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        lock(&self.requests).last().cloned()
    }

    async fn next_reply(&self, request: CompletionRequest) -> Result<MockReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let model = request.model.clone();
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        lock(&self.requests).push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = lock(&self.failing_models).get(&model).cloned();
        if let Some((kind, message)) = failing {
            return Err(provider_error(kind, message));
        }

        let queued = lock(&self.replies).pop_front();
        match queued {
            Some(MockReply::Error(kind, message)) => Err(provider_error(kind, message)),
            Some(reply) => Ok(reply),
            None => match lock(&self.fallback).clone() {
                Fallback::Echo => Ok(MockReply::Message(Message::assistant(format!(
                    "Echo: {}",
                    last_user
                )))),
                Fallback::Fail(kind, message) => Err(provider_error(kind, message)),
            },
        }
    }
}

fn provider_error(kind: ProviderErrorKind, message: String) -> HiveError {
    HiveError::Provider { kind, message }
}

/// Deltas a provider would send for `message`: text in small chunks, then
/// each tool call as a named opener followed by its arguments.
pub fn message_deltas(message: &Message) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    let chars: Vec<char> = message.content.chars().collect();
    for chunk in chars.chunks(4) {
        deltas.push(StreamDelta::Text(chunk.iter().collect()));
    }
    for call in &message.tool_calls {
        deltas.push(StreamDelta::ToolCall {
            id: call.id.clone(),
            name: Some(call.name.clone()),
            arguments: String::new(),
        });
        deltas.push(StreamDelta::ToolCall {
            id: call.id.clone(),
            name: None,
            arguments: call.arguments.clone(),
        });
    }
    deltas.push(StreamDelta::Finish(if message.has_tool_calls() {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    }));
    deltas
}

impl ModelClient for MockModelClient {
    fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            match self.next_reply(request).await? {
                MockReply::Message(message) => {
                    Ok(CompletionResponse::from_message("mock", message))
                }
                MockReply::Stream(_) => Err(HiveError::fatal(
                    "stream script queued for a non-streaming request",
                )),
                MockReply::Error(kind, message) => Err(provider_error(kind, message)),
            }
        })
    }

    fn create_completion_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            let deltas = match self.next_reply(request).await? {
                MockReply::Stream(deltas) => deltas,
                MockReply::Message(message) => message_deltas(&message),
                MockReply::Error(kind, message) => return Err(provider_error(kind, message)),
            };
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }
}

/// Tool that returns its `text` argument (or the whole argument object).
pub fn echo_tool(name: &str) -> FunctionTool {
    FunctionTool::new(name, "Echoes its input", |args, _ctx| match args.get("text") {
        Some(text) => ToolResult::Success(text.clone()),
        None => ToolResult::Success(args),
    })
}

/// Tool that always fails with `message`.
pub fn failing_tool(name: &str, message: &str) -> FunctionTool {
    let message = message.to_string();
    FunctionTool::new(name, "Always fails", move |_, _| ToolResult::failure(&message))
}

/// Tool that counts its invocations.
pub fn counting_tool(name: &str, reply: &str) -> (FunctionTool, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let reply = reply.to_string();
    let tool = FunctionTool::new(name, "Counts calls", move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
        ToolResult::success(reply.clone())
    });
    (tool, count)
}

/// Write `content` to a temporary `.toml` file.
pub fn temp_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

