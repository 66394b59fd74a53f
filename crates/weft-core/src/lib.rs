//! Business logic and repository trait definitions for weft.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `weft-types` -- never on
//! `weft-infra` or any database/IO crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod workflow;
