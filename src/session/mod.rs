//! Session store implementations.

pub mod memory;
pub mod sqlite;
pub mod store;
