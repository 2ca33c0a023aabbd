use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use hive_core::error::Result;
use hive_core::traits::ModelClient;
use hive_core::types::*;

/// Offline model client that replays queued completions.
///
/// When the queue is empty it answers with an echo of the last user
/// message. Streaming requests replay the same completions as deltas.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    responses: Mutex<VecDeque<Message>>,
    counter: AtomicU64,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let client = Self::new();
        for message in messages {
            client.push(message);
        }
        client
    }

    pub fn push(&self, message: Message) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(message);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Message::assistant(text));
    }

    pub fn push_tool_call(&self, name: impl Into<String>, arguments: serde_json::Value) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let call = ToolCall::new(format!("call_{}", n), name, arguments.to_string());
        self.push(Message::assistant_with_calls("", vec![call]));
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next_message(&self, request: &CompletionRequest) -> Message {
        let queued = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        queued.unwrap_or_else(|| {
            let last_user = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            Message::assistant(format!("Echo: {}", last_user))
        })
    }
}

/// Split a completed message into the delta sequence a provider would stream.
pub fn message_to_deltas(message: &Message) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    for word in message.content.split_inclusive(' ') {
        deltas.push(StreamDelta::Text(word.to_string()));
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
    let reason = if message.has_tool_calls() {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    };
    deltas.push(StreamDelta::Finish(reason));
    deltas
}

impl ModelClient for ScriptedClient {
    fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionResponse>> {
        Box::pin(async move {
            let message = self.next_message(&request);
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            debug!(model = %request.model, tool_calls = message.tool_calls.len(), "Scripted completion");
            Ok(CompletionResponse::from_message(format!("scripted-{}", n), message))
        })
    }

    fn create_completion_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async move {
            let message = self.next_message(&request);
            let deltas = message_to_deltas(&message);
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }
}
