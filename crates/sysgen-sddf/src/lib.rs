//! # sysgen-sddf
//!
//! Device-class subsystem builders over the `sysgen-core` resource graph.
//!
//! A subsystem captures the standard driver/virtualizer/client wiring
//! pattern for one device class:
//!
//! - [`timer`]: driver with direct clients
//! - [`serial`]: driver behind RX/TX virtualizers
//! - [`i2c`]: driver behind a single virtualizer
//! - [`blk`]: block storage with per-client partitions
//! - [`net`]: network with a copier PD per client
//! - [`gpu`]: GPU behind a single virtualizer
//! - [`fs`]: FAT and NFS filesystem composites
//! - [`vmm`]: virtual machine monitor with device passthrough
//!
//! Every builder moves through the same one-way lifecycle: construct, add
//! clients, [`connect`](timer::Timer::connect) (wires channels and shared
//! memory into the owning system, atomically), then serialize per-PD
//! configuration blobs. A failed step leaves both the builder and the
//! system unchanged.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blk;
pub mod config;
pub mod error;
pub mod fs;
pub mod gpu;
pub mod i2c;
pub mod net;
pub mod serial;
pub mod timer;
pub mod vmm;
mod wiring;

pub use blk::Blk;
pub use error::{Result, SddfError};
pub use fs::{FatFs, NfsFs};
pub use gpu::Gpu;
pub use i2c::I2c;
pub use net::{Mac, Net};
pub use serial::Serial;
pub use timer::Timer;
pub use vmm::Vmm;

use std::path::{Path, PathBuf};

/// Lifecycle of one subsystem builder. Transitions are one-directional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// Driver, virtualizers and device bound; no clients yet.
    Created,
    /// At least one client added.
    Configured,
    /// Channels wired and internal ids allocated.
    Connected,
    /// Configuration blobs emitted.
    Serialized,
}

/// Location of the device-driver-framework distribution a generated system
/// builds against.
///
/// The original tooling kept this in process-wide state set once at startup;
/// here it is an explicit value handed to every subsystem constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SddfConfig {
    root: PathBuf,
}

impl SddfConfig {
    /// Creates a configuration rooted at the framework checkout.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The framework root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}
