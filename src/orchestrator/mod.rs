//! Session orchestration modules.
//!
//! Covers the session lifecycle, the health handshake, worker exit
//! detection, step pipelines, and the job queue monitor.

pub mod child_monitor;
pub mod handshake;
pub mod pipeline;
pub mod queue_monitor;
pub mod session_manager;
