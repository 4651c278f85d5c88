//! Keeps playlists on a music streaming service and objects on an ontology
//! platform in sync, and ingests now-playing data into platform streams.

pub mod batcher;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod events;
pub mod ingest;
pub mod platform;
pub mod poller;
pub mod reconcile;
pub mod service;
pub mod subscription;
pub mod writers;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use context::{Daemon, SyncContext};
pub use error::{Result, SyncError};
