pub mod config;
pub mod data;
pub mod logging;
pub mod monitor;
pub mod session;
pub mod stats;
