//! Request handlers.

pub mod exports;
pub mod health;
pub mod vms;
