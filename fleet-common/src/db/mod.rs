//! Database initialization for the fleet services

pub mod init;

pub use init::{init_database, open_pool};
