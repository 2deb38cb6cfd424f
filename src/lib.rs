pub mod config;
pub mod errors;
pub mod importers;
pub mod logging;
pub mod platform;
