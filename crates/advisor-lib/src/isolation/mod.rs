//! CPU isolation for dedicated containers without NUMA binding
//!
//! This module provides:
//! - Isolation thresholds, pool budgets and lock-in/lock-out settings
//! - The per-container hysteresis controller

mod config;
mod controller;

pub use config::IsolationConfiguration;
pub use controller::{IsolationController, IsolationReport, IsolationState, IsolationTransition};
