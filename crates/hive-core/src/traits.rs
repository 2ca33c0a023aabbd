use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::tool::{ToolContext, ToolResult};
use crate::types::*;

/// The narrow interface to an LLM provider.
///
/// Implementations classify their own failures with
/// [`ProviderErrorKind`](crate::error::ProviderErrorKind) so the retry policy
/// never has to inspect error text.
pub trait ModelClient: Send + Sync + 'static {
    /// Request a full completion.
    fn create_completion(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<CompletionResponse>>;

    /// Request a completion as a stream of deltas.
    fn create_completion_stream(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// A callable function exposed to the model.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (matched exactly against model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments. Informs the model only.
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    /// Invoke the tool with decoded arguments.
    fn call(&self, args: serde_json::Value, ctx: ToolContext) -> BoxFuture<'_, ToolResult>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

/// Short-term recall plus a long-term log keyed by entry type.
pub trait MemoryStore: Send + Sync + 'static {
    fn append(&self, entry: MemoryEntry);

    /// The last `n` short-term entries, oldest first.
    fn recent(&self, n: usize) -> Vec<MemoryEntry>;

    /// Long-term entries of `kind` whose context contains every key/value in `filter`.
    fn search(&self, kind: &str, filter: Option<&ContextVariables>) -> Vec<MemoryEntry>;

    fn serialize(&self) -> Result<Vec<u8>>;

    /// Replace the store's contents with previously serialized data.
    fn deserialize(&self, data: &[u8]) -> Result<()>;
}
