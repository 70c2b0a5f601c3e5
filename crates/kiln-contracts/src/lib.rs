//! Data model, static provider policy and persistence contracts for the kiln
//! generation orchestrator.

pub mod content;
pub mod error;
pub mod events;
pub mod jobs;
pub mod providers;
pub mod store;
