pub mod config;
pub mod controller;
pub mod dex;
pub mod metrics;
pub mod net;
pub mod prometheus_exporter;
pub mod telemetry;
pub mod template;
pub mod version;
