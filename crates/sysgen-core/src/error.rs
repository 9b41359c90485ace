//! Error types for the core graph.

use thiserror::Error;

/// Result type alias for core graph operations.
pub type Result<T> = std::result::Result<T, SdfError>;

/// Errors that can occur while assembling or rendering a system description.
///
/// Every failure is local and recoverable; the graph is left unchanged when
/// an operation returns an error.
#[derive(Debug, Error)]
pub enum SdfError {
    /// A PD or MR was registered under a name that is already taken.
    #[error("duplicate name '{0}'")]
    DuplicateName(String),

    /// An entity was passed to an operation that requires it to be
    /// registered with the system first.
    #[error("'{0}' is not registered with the system")]
    NotRegistered(String),

    /// The same entity was registered twice.
    #[error("entity is already registered")]
    AlreadyRegistered,

    /// A handle referred to a destroyed or foreign entity.
    #[error("stale or foreign handle (slot {0})")]
    StaleHandle(u32),

    /// A parent/child or VM-attach relation would violate the graph shape.
    #[error("structural error: {0}")]
    StructuralCycle(String),

    /// No unused id remains in the relevant local id space.
    #[error("local id space exhausted ({0} ids)")]
    IdExhausted(u8),

    /// A caller-fixed id is already in use in the relevant id space.
    #[error("id {0} is already in use")]
    IdInUse(u8),

    /// Both ends of a channel referred to the same PD.
    #[error("channel endpoints must be two distinct PDs")]
    IdenticalEndpoints,

    /// An address or size failed its format or alignment constraint.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The downward physical allocator ran out of space below `paddr_top`.
    #[error("physical address space below {0:#x} exhausted")]
    AddressExhausted(u64),

    /// Document serialization failed.
    #[error("render error: {0}")]
    Render(#[from] serde_json::Error),

    /// Writing an output artifact failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
