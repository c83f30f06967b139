//! DF-e distribution sync and recipient manifestation engine.
//!
//! Pulls fiscal documents addressed to a taxpayer from the national distribution web service,
//! tracks the per-company NSU cursor with gap backfill, and submits signed manifestation events.

pub mod certificate;
pub mod codec;
pub mod config;
pub mod manifest;
pub mod service;
pub mod sync;
pub mod utils;
pub mod ws;

pub use config::{DfeConfig, Environment};
pub use service::{Connector, DfeService, SyncError, TlsConnector};
