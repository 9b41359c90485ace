//! Error types for subsystem builders.

use thiserror::Error;

use sysgen_core::SdfError;

use crate::net::Mac;
use crate::Lifecycle;

/// Result type alias for subsystem operations.
pub type Result<T> = std::result::Result<T, SddfError>;

/// Errors that can occur while configuring or connecting a subsystem.
///
/// A failed operation leaves the builder and the owning system unchanged.
#[derive(Debug, Error)]
pub enum SddfError {
    /// The PD is already a client of this subsystem.
    #[error("'{0}' is already a client of this subsystem")]
    DuplicateClient(String),

    /// Another client already uses this MAC address.
    #[error("MAC address {0} is already in use by another client")]
    DuplicateMacAddr(Mac),

    /// The PD already serves as another client's copier.
    #[error("'{0}' is already another client's copier")]
    DuplicateCopier(String),

    /// A passthrough device with this name was already added.
    #[error("passthrough device '{0}' was already added")]
    DuplicateDevice(String),

    /// The MAC address fails its format constraints.
    #[error("invalid MAC address {0}")]
    InvalidMacAddr(Mac),

    /// The PD already has a role (driver, virtualizer or copier) that
    /// conflicts with the requested one.
    #[error("'{0}' cannot take this role in the subsystem")]
    InvalidClient(String),

    /// An operation was attempted out of lifecycle order.
    #[error("{op} is not legal in the {state:?} state")]
    InvalidState {
        /// The rejected operation.
        op: &'static str,
        /// The builder's current state.
        state: Lifecycle,
    },

    /// An underlying graph operation failed.
    #[error(transparent)]
    Core(#[from] SdfError),

    /// Writing a configuration blob failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
