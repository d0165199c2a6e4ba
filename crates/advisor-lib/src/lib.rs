//! Node-local CPU allocation state and headroom engine
//!
//! This crate provides the core functionality for:
//! - CPU sets and NUMA topology discovery
//! - The pod/container allocation table and per-NUMA machine state
//! - Isolated and shared pool quantity aggregation
//! - CPU isolation hysteresis
//! - Headroom policies
//! - The periodic advisor control loop, its health tracking and structured logging

pub mod advisor;
pub mod error;
pub mod headroom;
pub mod health;
pub mod isolation;
pub mod machine;
pub mod observability;
pub mod state;

pub use advisor::{AdvisorLoopConfig, AdvisorSnapshot, CpuAdvisor, CpuAdvisorBuilder};
pub use error::{AdvisorError, Result};
pub use health::{ControlStep, HealthRegistry, HealthReport};
pub use machine::{CpuSet, CpuTopology, TopologyProvider};
pub use observability::AdvisorLogger;
