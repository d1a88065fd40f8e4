pub mod client;
pub mod error;
pub mod metrics;
pub mod names;
pub mod resources;
pub mod types;
mod url;
pub mod wait;
