pub mod cancel;
pub mod client;
pub mod config;
pub mod credentials;
pub mod orchestrator;
pub mod prompt;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use cancel::CancelToken;
pub use client::{BackoffPolicy, ClientSettings, GenerationClient};
pub use config::{EngineConfig, Provider};
pub use credentials::Credentials;
pub use orchestrator::{Action, ActionError, Orchestrator, OrchestratorState, RenderKind};
pub use transport::{GenerationTransport, HttpTransport, TransportError, WireResponse};
pub use wire::WirePayload;
