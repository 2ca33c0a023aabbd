use std::fmt;
use std::sync::Arc;

use crate::traits::{MemoryStore, Tool};
use crate::types::{ContextVariables, MemoryEntry, ToolDefinition};

type InstructionsFn = dyn Fn(&ContextVariables) -> String + Send + Sync;

/// System instructions for an agent.
#[derive(Clone)]
pub enum Instructions {
    Static(String),
    /// Computed from the run's context variables at the start of every turn.
    Dynamic(Arc<InstructionsFn>),
}

impl Instructions {
    pub fn resolve(&self, variables: &ContextVariables) -> String {
        match self {
            Self::Static(text) => text.clone(),
            Self::Dynamic(f) => f(variables),
        }
    }
}

impl Default for Instructions {
    fn default() -> Self {
        Self::Static(String::new())
    }
}

impl fmt::Debug for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(text) => f.debug_tuple("Static").field(text).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// An LLM-backed agent: instructions, a model, and the tools it may call.
///
/// Agents are built once and shared behind `Arc`; a handoff swaps which
/// agent is active rather than mutating one.
#[derive(Clone, Default)]
pub struct Agent {
    pub name: String,
    /// Model id. Empty means "use the configured default".
    pub model: String,
    pub instructions: Instructions,
    pub tools: Vec<Arc<dyn Tool>>,
    pub tool_choice: Option<String>,
    pub parallel_tool_calls: bool,
    pub memory: Option<Arc<dyn MemoryStore>>,
}

impl Agent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Instructions::Static(instructions.into());
        self
    }

    pub fn with_dynamic_instructions<F>(mut self, f: F) -> Self
    where
        F: Fn(&ContextVariables) -> String + Send + Sync + 'static,
    {
        self.instructions = Instructions::Dynamic(Arc::new(f));
        self
    }

    pub fn with_tool(mut self, tool: impl Tool) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn with_shared_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_tool_choice(mut self, choice: impl Into<String>) -> Self {
        self.tool_choice = Some(choice.into());
        self
    }

    pub fn with_parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = enabled;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Exact-name lookup in the tool table.
    pub fn find_tool(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Append to this agent's memory, if it has one.
    pub fn remember(&self, entry: MemoryEntry) {
        if let Some(memory) = &self.memory {
            memory.append(entry);
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tools: Vec<&str> = self.tools.iter().map(|t| t.name()).collect();
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("instructions", &self.instructions)
            .field("tools", &tools)
            .field("parallel_tool_calls", &self.parallel_tool_calls)
            .field("has_memory", &self.memory.is_some())
            .finish()
    }
}
