pub mod config;
pub mod pacing;
pub mod publisher;
pub mod trade;
