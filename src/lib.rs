//! Collection-to-canonical anime resolution with theme-song acquisition.

pub mod acquisition;
pub mod asset_cache;
pub mod backends;
pub mod catalog;
pub mod config;
pub mod error;
pub mod export;
pub mod identity_cache;
pub mod media_file_discovery;
pub mod protocol;
pub mod resolver;
pub mod worker_pool;
