//! # Fleet Common Library
//!
//! Shared code for the fleet telemetry services:
//! - Device position data model and validation
//! - Event types (`FleetEvent`) and the `EventBus`
//! - Bootstrap configuration and root folder resolution
//! - SQLite schema initialization
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{Error, Result};
pub use models::{DevicePosition, Priority, QueuedPosition, Severity};
