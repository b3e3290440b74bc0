pub mod handlers;
pub mod lock;
pub mod registry;
pub mod server;
pub mod socket;

pub use registry::SessionRegistry;
pub use server::{start, ServerConfig, ServerHandle};
