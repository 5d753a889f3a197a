//! Remote collaborator implementations

pub mod memory;

pub use memory::{Fault, InMemoryBackend};
