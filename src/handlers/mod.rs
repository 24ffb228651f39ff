//! HTTP handlers. Each takes already-resolved inputs from the dispatcher.

pub mod index_handlers;
pub mod object_handlers;
