//! Error types for the CPU advisor engine

/// Errors surfaced by the allocation-state and headroom engine.
///
/// Configuration errors abort the current control period and leave the
/// previously published results in place. Per-record data problems are not
/// represented here: they are logged and the record is skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdvisorError {
    /// Machine state was requested without a CPU topology
    #[error("machine state generation got nil topology")]
    MissingTopology,

    /// The headroom policy has no value for a required control knob
    #[error("control knob {0} is missing")]
    MissingControlKnob(String),

    /// Isolation configuration failed validation
    #[error("invalid isolation configuration: {0}")]
    InvalidConfig(String),

    /// No headroom policy is registered under this name
    #[error("unknown headroom policy: {0}")]
    UnknownHeadroomPolicy(String),

    /// Malformed Linux cpu-list string
    #[error("failed to parse cpuset: {0}")]
    CpuSetParse(String),

    /// Topology could not be discovered or is inconsistent
    #[error("topology error: {0}")]
    Topology(String),
}

pub type Result<T> = std::result::Result<T, AdvisorError>;
