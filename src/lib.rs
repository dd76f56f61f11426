//! Message triage — resumable classification workflow for chat messages.

pub mod api;
pub mod channels;
pub mod config;
pub mod driver;
pub mod error;
pub mod llm;
pub mod store;
pub mod workflow;
