//! Command types that can travel through the queue.

pub mod command;
pub mod registry;

pub use command::{Command, DecodedCommand, Noop};
pub use registry::{CommandDecoder, TypeRegistry};
