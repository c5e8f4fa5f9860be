//! Messenger real-time server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;
