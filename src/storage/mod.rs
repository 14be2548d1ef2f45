//! Storage collaborator: the durable store of events and locations.

pub mod memory;
pub mod traits;
