pub mod cli;
pub mod client;
pub mod correlation;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod models;
pub mod scenario;
pub mod template;
pub mod thresholds;
pub mod utils;
pub mod ws;
