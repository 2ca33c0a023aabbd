pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod tool;
pub mod traits;
pub mod types;

pub use agent::{Agent, Instructions};
pub use config::AppConfig;
pub use error::{HiveError, ProviderErrorKind, Result};
pub use event::EventBus;
pub use tool::{ContextDelta, FunctionTool, ToolContext, ToolResult};
pub use traits::{MemoryStore, ModelClient, Tool};
pub use types::*;
