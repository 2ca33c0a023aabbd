pub mod registry;
pub mod retry;
pub mod scripted;

pub use registry::{ClientFactory, ClientRegistry};
pub use retry::RetryPolicy;
pub use scripted::ScriptedClient;
