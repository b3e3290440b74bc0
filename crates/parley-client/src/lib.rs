//! Participant-side building blocks: the local conversation cache, the
//! reconnect loop, the deferred input slot, the turn driver, and the
//! model/tool boundaries.

pub mod backoff;
pub mod cache;
pub mod error;
pub mod model;
pub mod session;
pub mod tools;
pub mod transport;

pub use backoff::Backoff;
pub use cache::SessionCache;
pub use error::ClientError;
pub use model::{MockModel, ModelEvent, ModelService, ModelStream, ScriptedTurn, ToolDefinition};
pub use session::{PendingInput, TurnDriver, TurnOutcome};
pub use tools::{MockToolExecutor, ToolError, ToolExecutor};
pub use transport::{establish, ChannelTransport, Connector, Transport};
