use std::collections::HashSet;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hive_core::error::{HiveError, Result};
use hive_core::types::*;

use crate::swarm::{Response, RunRequest, Swarm};

/// Callbacks fired while a streamed run progresses. All default to no-ops.
pub trait StreamHandler: Send + Sync {
    fn on_start(&self) {}

    fn on_token(&self, _token: &str) {}

    /// A call was assembled and executed; `result` is the tool-role message.
    fn on_tool_call(&self, _call: &ToolCall, _result: &Message) {}

    fn on_complete(&self, _message: &Message) {}

    fn on_error(&self, _error: &HiveError) {}
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Rebuilds tool calls from streamed fragments.
///
/// Fragments are buffered per call id. A call is ready once it has a name
/// and its argument buffer parses as JSON; ready calls are returned exactly
/// once, later fragments for the same id are dropped.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    pending: Vec<PendingCall>,
    processed: HashSet<String>,
    last_opened: Option<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. An empty `id` continues the most recently opened call.
    pub fn ingest(&mut self, id: &str, name: Option<&str>, fragment: &str) -> Option<ToolCall> {
        let id = if id.is_empty() {
            match &self.last_opened {
                Some(last) => last.clone(),
                None => {
                    debug!(fragment, "Dropping fragment with no open call");
                    return None;
                }
            }
        } else {
            id.to_string()
        };

        if self.processed.contains(&id) {
            debug!(call_id = %id, "Ignoring fragment for processed call");
            return None;
        }

        let index = match self.pending.iter().position(|c| c.id == id) {
            Some(index) => index,
            None => {
                self.pending.push(PendingCall {
                    id: id.clone(),
                    ..Default::default()
                });
                self.last_opened = Some(id);
                self.pending.len() - 1
            }
        };

        let call = &mut self.pending[index];
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            call.name = name.to_string();
        }
        call.arguments.push_str(fragment);

        if call.name.is_empty() || call.arguments.trim().is_empty() {
            return None;
        }
        if serde_json::from_str::<serde_json::Value>(&call.arguments).is_err() {
            return None;
        }

        let call = self.pending.remove(index);
        self.processed.insert(call.id.clone());
        Some(ToolCall::new(call.id, call.name, call.arguments))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<&str> {
        self.pending.iter().map(|c| c.id.as_str()).collect()
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    /// Forget partially buffered calls before a stream is reopened.
    /// Processed ids are kept so replays stay idempotent.
    pub fn reset_pending(&mut self) {
        self.pending.clear();
        self.last_opened = None;
    }
}

enum StreamOutcome {
    Ready { text: String, call: ToolCall },
    Finished { text: String },
}

impl Swarm {
    /// Streamed variant of [`Swarm::run`].
    ///
    /// Tokens are forwarded as they arrive. When a tool call completes
    /// mid-stream it runs immediately and the stream is reopened with the
    /// result appended; every reopen counts against the turn budget.
    ///
    /// Running out of budget is not an error: the response is returned as
    /// is, so its last message may be a tool result rather than a reply.
    /// Check `Response::turns` against the budget to tell the cases apart.
    pub async fn run_streaming(
        &self,
        request: RunRequest,
        handler: &dyn StreamHandler,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        match self.stream_turns(request, handler, cancel).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(error = %e, "Streamed run failed");
                handler.on_error(&e);
                self.event_bus().publish(AgentEvent::RunError {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn stream_turns(
        &self,
        request: RunRequest,
        handler: &dyn StreamHandler,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        let mut active = request.agent.clone().ok_or(HiveError::NilAgent)?;
        let max_rounds = self.turn_budget(&request);
        let mut variables = request.context_variables.clone();
        let mut history = request.messages.clone();
        let start = history.len();
        let mut tool_results = Vec::new();
        let mut usage = Usage::default();
        let mut assembler = ToolCallAssembler::new();

        handler.on_start();
        self.event_bus().publish(AgentEvent::RunStarted {
            agent: active.name.clone(),
        });

        for round in 1..=max_rounds {
            if cancel.is_cancelled() {
                return Err(HiveError::Cancelled);
            }

            let mut completion = self.build_request(&active, &history, &variables, &request, true);
            completion.stream = true;
            let stream = self.open_stream(completion, cancel).await?;
            let outcome =
                consume(stream, &mut assembler, handler, self, &mut usage, cancel).await?;

            match outcome {
                StreamOutcome::Ready { text, call } => {
                    debug!(call_id = %call.id, tool = %call.name, round, "Tool call assembled");
                    history.push(
                        Message::assistant_with_calls(text, vec![call.clone()])
                            .with_name(active.name.clone()),
                    );
                    let executed = self
                        .run_tool_call(&active, &call, &variables, cancel)
                        .await;
                    for message in &executed.messages {
                        handler.on_tool_call(&call, message);
                    }
                    history.extend(executed.messages);
                    tool_results.extend(executed.executions);
                    variables.extend(executed.updates);
                    if let Some(next) = executed.next_agent {
                        self.event_bus().publish(AgentEvent::Handoff {
                            from: active.name.clone(),
                            to: next.name.clone(),
                        });
                        active = next;
                    }
                    assembler.reset_pending();
                }
                StreamOutcome::Finished { text } => {
                    if assembler.has_pending() {
                        return Err(HiveError::StreamIncomplete(
                            assembler.pending_ids().join(", "),
                        ));
                    }
                    let message = Message::assistant(text).with_name(active.name.clone());
                    history.push(message.clone());
                    handler.on_complete(&message);
                    info!(agent = %active.name, rounds = round, "Streamed run complete");
                    self.event_bus().publish(AgentEvent::RunComplete {
                        agent: active.name.clone(),
                        turns: round,
                        usage,
                    });
                    return Ok(Response {
                        messages: history.split_off(start),
                        agent: active,
                        context_variables: variables,
                        tool_results,
                        usage,
                        turns: round,
                    });
                }
            }
        }

        warn!(agent = %active.name, max_rounds, "Turn budget exhausted while streaming");
        if let Some(last) = history.last().filter(|_| history.len() > start) {
            handler.on_complete(last);
        }
        Ok(Response {
            messages: history.split_off(start),
            agent: active,
            context_variables: variables,
            tool_results,
            usage,
            turns: max_rounds,
        })
    }

    async fn open_stream(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'_, Result<StreamDelta>>> {
        let timeout = Duration::from_secs(self.config().model.request_timeout_secs);
        let client = self.client();
        self.retry_policy()
            .execute(cancel, |_attempt| {
                let request = request.clone();
                async move {
                    match tokio::time::timeout(timeout, client.create_completion_stream(request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(HiveError::transient(format!(
                            "stream open timed out after {}s",
                            timeout.as_secs()
                        ))),
                    }
                }
            })
            .await
    }
}

/// Read deltas until a tool call is ready or the stream ends.
async fn consume(
    mut stream: BoxStream<'_, Result<StreamDelta>>,
    assembler: &mut ToolCallAssembler,
    handler: &dyn StreamHandler,
    swarm: &Swarm,
    usage: &mut Usage,
    cancel: &CancellationToken,
) -> Result<StreamOutcome> {
    let mut text = String::new();
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = cancel.cancelled() => return Err(HiveError::Cancelled),
        };
        let Some(delta) = next else {
            return Ok(StreamOutcome::Finished { text });
        };
        match delta? {
            StreamDelta::Text(token) => {
                handler.on_token(&token);
                swarm
                    .event_bus()
                    .publish(AgentEvent::TextDelta(token.clone()));
                text.push_str(&token);
            }
            StreamDelta::ToolCall {
                id,
                name,
                arguments,
            } => {
                if let Some(call) = assembler.ingest(&id, name.as_deref(), &arguments) {
                    return Ok(StreamOutcome::Ready { text, call });
                }
            }
            StreamDelta::Usage(delta) => usage.add(&delta),
            StreamDelta::Finish(reason) => debug!(?reason, "Stream finished"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use super::*;
    use hive_core::agent::Agent;
    use hive_test_utils::{counting_tool, MockModelClient};

    #[derive(Default)]
    struct Recorder {
        started: Mutex<bool>,
        tokens: Mutex<Vec<String>>,
        tool_calls: Mutex<Vec<(String, String)>>,
        completed: Mutex<Option<String>>,
        errors: Mutex<Vec<String>>,
    }

    impl StreamHandler for Recorder {
        fn on_start(&self) {
            *self.started.lock().unwrap() = true;
        }

        fn on_token(&self, token: &str) {
            self.tokens.lock().unwrap().push(token.to_string());
        }

        fn on_tool_call(&self, call: &ToolCall, result: &Message) {
            self.tool_calls
                .lock()
                .unwrap()
                .push((call.name.clone(), result.content.clone()));
        }

        fn on_complete(&self, message: &Message) {
            *self.completed.lock().unwrap() = Some(message.content.clone());
        }

        fn on_error(&self, error: &HiveError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn fragment(id: &str, name: Option<&str>, arguments: &str) -> StreamDelta {
        StreamDelta::ToolCall {
            id: id.to_string(),
            name: name.map(str::to_string),
            arguments: arguments.to_string(),
        }
    }

    #[test]
    fn test_name_without_arguments_is_not_ready() {
        let mut assembler = ToolCallAssembler::new();
        assert!(assembler.ingest("c1", Some("search"), "").is_none());
        assert!(assembler.has_pending());
        assert_eq!(assembler.pending_ids(), vec!["c1"]);
    }

    #[test]
    fn test_partial_json_waits_for_completion() {
        let mut assembler = ToolCallAssembler::new();
        assert!(assembler.ingest("c1", Some("search"), r#"{"query": "ru"#).is_none());
        let call = assembler.ingest("c1", None, r#"st"}"#).unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, r#"{"query": "rust"}"#);
        assert!(!assembler.has_pending());
        assert!(assembler.is_processed("c1"));
    }

    #[test]
    fn test_empty_id_folds_into_last_opened_call() {
        let mut assembler = ToolCallAssembler::new();
        assembler.ingest("c1", Some("first"), "");
        assembler.ingest("c2", Some("second"), "");
        assert!(assembler.ingest("", None, "{\"n\":").is_none());
        let call = assembler.ingest("", None, "2}").unwrap();
        assert_eq!(call.id, "c2");
        assert_eq!(call.name, "second");
        assert_eq!(assembler.pending_ids(), vec!["c1"]);
    }

    #[test]
    fn test_empty_id_without_open_call_is_dropped() {
        let mut assembler = ToolCallAssembler::new();
        assert!(assembler.ingest("", None, "{}").is_none());
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_duplicate_complete_fragment_yields_once() {
        let mut assembler = ToolCallAssembler::new();
        assert!(assembler.ingest("c1", Some("save"), "{}").is_some());
        assert!(assembler.ingest("c1", Some("save"), "{}").is_none());
        assembler.reset_pending();
        assert!(assembler.ingest("c1", Some("save"), "{}").is_none());
    }

    #[tokio::test]
    async fn test_text_stream_forwards_tokens() {
        let client = Arc::new(MockModelClient::new());
        client.push_text("Hello streaming world");
        let swarm = Swarm::new(client.clone());
        let recorder = Recorder::default();

        let response = swarm
            .run_streaming(
                RunRequest::new(Arc::new(Agent::new("a"))).with_message(Message::user("hi")),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(*recorder.started.lock().unwrap());
        assert_eq!(recorder.tokens.lock().unwrap().concat(), "Hello streaming world");
        assert_eq!(
            recorder.completed.lock().unwrap().as_deref(),
            Some("Hello streaming world")
        );
        assert_eq!(response.messages.len(), 1);
        assert!(client.last_request().unwrap().stream);
    }

    #[tokio::test]
    async fn test_tool_call_executes_mid_stream_and_restarts() {
        let client = Arc::new(MockModelClient::new());
        client
            .push_stream(vec![
                StreamDelta::Text("Checking. ".into()),
                fragment("c1", Some("lookup"), ""),
                fragment("", None, r#"{"city":"#),
                fragment("", None, r#""Oslo"}"#),
                // Never read: the stream is closed once the call is ready
                fragment("c1", None, r#"{"city":"Oslo"}"#),
                StreamDelta::Finish(FinishReason::ToolCalls),
            ])
            .push_stream(vec![
                // Provider replays the finished call on the reopened stream
                fragment("c1", Some("lookup"), r#"{"city":"Oslo"}"#),
                StreamDelta::Text("It is cold.".into()),
                StreamDelta::Finish(FinishReason::Stop),
            ]);
        let (tool, count) = counting_tool("lookup", "-3C");
        let agent = Arc::new(Agent::new("weather").with_tool(tool));
        let recorder = Recorder::default();

        let response = Swarm::new(client.clone())
            .run_streaming(
                RunRequest::new(agent).with_message(Message::user("weather in Oslo")),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            recorder.tool_calls.lock().unwrap().clone(),
            vec![("lookup".to_string(), "-3C".to_string())]
        );
        assert_eq!(response.messages.len(), 3);
        assert_eq!(response.messages[0].content, "Checking. ");
        assert_eq!(response.messages[0].tool_calls[0].arguments, r#"{"city":"Oslo"}"#);
        assert_eq!(response.messages[1].role, Role::Tool);
        assert_eq!(response.messages[2].content, "It is cold.");

        // The reopened stream sees the tool result
        let second = &client.requests()[1];
        assert_eq!(second.messages.last().unwrap().content, "-3C");
    }

    #[tokio::test]
    async fn test_budget_spent_on_tool_call_returns_tool_result() {
        let client = Arc::new(MockModelClient::new());
        client.push_stream(vec![
            fragment("c1", Some("lookup"), r#"{"city":"Oslo"}"#),
            StreamDelta::Finish(FinishReason::ToolCalls),
        ]);
        let (tool, count) = counting_tool("lookup", "-3C");
        let agent = Arc::new(Agent::new("weather").with_tool(tool));
        let recorder = Recorder::default();

        let response = Swarm::new(client.clone())
            .run_streaming(
                RunRequest::new(agent)
                    .with_message(Message::user("weather in Oslo"))
                    .with_max_turns(1),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(response.turns, 1);
        assert_eq!(response.messages.last().unwrap().role, Role::Tool);
        assert_eq!(recorder.completed.lock().unwrap().as_deref(), Some("-3C"));
        assert_eq!(client.attempts(), 1);
    }

    #[tokio::test]
    async fn test_unterminated_call_is_an_error() {
        let client = Arc::new(MockModelClient::new());
        client.push_stream(vec![
            fragment("c9", Some("lookup"), r#"{"city": "Os"#),
            StreamDelta::Finish(FinishReason::ToolCalls),
        ]);
        let recorder = Recorder::default();

        let err = Swarm::new(client)
            .run_streaming(
                RunRequest::new(Arc::new(Agent::new("a"))).with_message(Message::user("hi")),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HiveError::StreamIncomplete(ref ids) if ids == "c9"));
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
        assert!(recorder.completed.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool_while_streaming() {
        let client = Arc::new(MockModelClient::new());
        client
            .push_stream(vec![fragment("c1", Some("warp_drive"), "{}")])
            .push_text("Never mind.");
        let recorder = Recorder::default();

        let response = Swarm::new(client)
            .run_streaming(
                RunRequest::new(Arc::new(Agent::new("a"))).with_message(Message::user("go")),
                &recorder,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(response.messages[1].content.contains("warp_drive"));
        assert_eq!(response.last_content(), Some("Never mind."));
    }

    #[tokio::test]
    async fn test_nil_agent_reported_to_handler() {
        let client = Arc::new(MockModelClient::new());
        let recorder = Recorder::default();
        let err = Swarm::new(client)
            .run_streaming(RunRequest::default(), &recorder, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NilAgent));
        assert_eq!(recorder.errors.lock().unwrap().clone(), vec!["agent cannot be nil"]);
    }
}
