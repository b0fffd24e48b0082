//! Keeping the local mirrors in sync with their origins.

pub mod budget;
pub mod scheduler;
pub mod updater;
