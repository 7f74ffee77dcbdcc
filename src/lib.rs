/// Lib for game-master
///
/// Most of the game logic lives in `engine.rs`. This file allows us to build
/// the crate as a library for use in integration tests, and builds the
/// component table together for `main.rs` to wire up.
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hub;
pub mod http;
pub mod identity;
pub mod payloads;
pub mod rpc;
pub mod session_manager;
pub mod ship_map;
pub mod signature;
pub mod task_catalog;

#[macro_use]
pub mod log_macros;
