//! Database access for fleet-sync
//!
//! Schema creation lives in `fleet_common::db`; this module holds the
//! queries the pipeline components run against it.

pub mod consistency;
pub mod fleet;
pub mod positions;
pub mod sessions;
pub mod settings;
pub mod watermark;
