//! Core config, errors, data model, and provider wire frames for voxflow.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
