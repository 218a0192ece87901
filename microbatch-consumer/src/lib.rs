pub mod assembler;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics_consts;
pub mod processor;
