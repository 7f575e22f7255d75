pub mod config;
pub mod desk;
pub mod error;
