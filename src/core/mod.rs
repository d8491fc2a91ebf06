//! Configuration, error and request types shared by every subsystem.

pub mod config;
pub mod error;
pub mod types;
