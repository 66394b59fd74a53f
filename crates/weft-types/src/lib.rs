//! Shared domain types for weft.
//!
//! This crate contains the types shared by the engine and its storage
//! adapters: the workflow document model, run status, checkpoint records,
//! workflow events, configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
