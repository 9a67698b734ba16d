//! ei: a multi-persona AI companion engine.
//!
//! The core is a per-persona scheduling and data-maintenance engine: user
//! messages debounce into coalesced requests with one in-flight response
//! per persona, while a persistent priority queue of extraction tasks
//! mines structured knowledge in the background and time-based decay keeps
//! engagement levels drifting toward their ideals between touches.

pub mod ceremony;
pub mod commands;
pub mod config;
pub mod database;
pub mod decay;
pub mod engine;
pub mod entities;
pub mod error;
pub mod extraction;
pub mod history;
pub mod llm;
pub mod personas;
pub mod queue;
pub mod snapshot;
pub mod utils;
pub mod visibility;

pub use config::Config;
pub use engine::Engine;
pub use error::LlmError;
