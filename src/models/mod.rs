//! Domain model module declarations.

pub mod event;
pub mod execution;
pub mod health;
pub mod outcome;
pub mod session;
pub mod work_item;
