pub mod entry;
pub mod error;
pub mod ids;
pub mod repair;
pub mod wire;
