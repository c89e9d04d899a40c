//! Core modules for Sightline's storage engine.
//!
//! Shared primitives (errors, time, config) and the crash-safe segment
//! storage that every investigation session is written through.

pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod migration;
pub mod schemas;
pub mod severity;
pub mod storage;
pub mod store;
pub mod time;
