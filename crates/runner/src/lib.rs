//! HTTP surface for the herd supervisor: script uploads, project archives,
//! start/stop control and log tails behind an API key.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod extract;
pub mod payload;
pub mod storage;

pub use api::{router, AppState};
pub use config::Config;
