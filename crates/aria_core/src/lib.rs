//! Predictive automation core for the Aria assistant.
//!
//! Maintains a rolling context of user behavior, environment, and schedule
//! signals, analyzes it into patterns, derives confidence-scored predictions,
//! and drives a device/automation registry through a rule scheduler. A
//! personality adapter shapes everything the user sees.
//!
//! The [`engine::Core`] type is the composition root; everything else is
//! reachable through it.

pub mod config;
pub mod context;
pub mod emotional;
pub mod engine;
pub mod error;
pub mod patterns;
pub mod persona;
pub mod predict;
pub mod providers;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use config::CoreConfig;
pub use engine::Core;
pub use error::{CoreError, Result};
pub use storage::{Store, StoreLocation};
