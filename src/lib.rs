#![forbid(unsafe_code)]

pub mod broadcast;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod ipc;
pub mod jobs;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod process;
pub mod registry;
pub mod server;
pub mod signal;
pub mod state;
pub mod storage;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
