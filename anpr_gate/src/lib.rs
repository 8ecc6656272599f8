pub mod access;
pub mod config;
pub mod events;
pub mod metrics;
pub mod plate_detection;
pub mod server;
pub mod service;
pub mod state;
pub mod utils;
