//! Services (use cases) built on the engine.
//!
//! Services depend on traits (ports), never on concrete infrastructure
//! implementations.

pub mod workflow;
