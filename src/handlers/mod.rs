//! HTTP request handlers.

pub mod upload;
