//! Core domain types: task identifiers and the task entity.

pub mod task;
pub mod types;
