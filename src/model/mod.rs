//! Identity types and the persistent inventory.

pub mod inventory;
pub mod types;
