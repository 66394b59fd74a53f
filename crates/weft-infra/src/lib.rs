//! Infrastructure layer for weft.
//!
//! Implements the checkpoint repository trait defined in `weft-core` on
//! SQLite (WAL mode, split read/write pools) and loads `config.toml`.

pub mod config;
pub mod sqlite;
