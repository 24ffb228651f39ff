//! Object store contract and its backends.

pub mod disk_store;
pub mod memory_store;
pub mod store;
