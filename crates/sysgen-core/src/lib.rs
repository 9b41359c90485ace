//! # sysgen-core
//!
//! Build-time resource graph for statically-partitioned microkernel systems.
//!
//! A [`SystemDescription`] owns every entity created for one generated
//! system:
//!
//! - [`pd`]: protection domains (isolated execution units)
//! - [`memory`]: memory regions and address-space mappings
//! - [`channel`]: notification/IPC links between two protection domains
//! - [`vm`]: guest virtual machines and their vCPUs
//! - [`irq`]: hardware interrupt bindings
//!
//! Entities are referenced through generation-checked [`store::Handle`]s so a
//! destroyed entity is detected rather than silently aliased. [`render`]
//! walks the assembled graph in insertion order and produces a deterministic,
//! re-parseable system document for the downstream build toolchain.
//!
//! Device-tree access is delegated to a collaborator behind the [`dtb`]
//! interface; this crate never parses device trees itself.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod dtb;
pub mod error;
pub mod ids;
pub mod irq;
pub mod memory;
pub mod pd;
pub mod render;
pub mod store;
pub mod system;
pub mod vm;

pub use channel::{Channel, ChannelEnd, ChannelHandle, ChannelOptions};
pub use dtb::{DeviceTreeSource, DtIrq, DtNode, DtRegion};
pub use error::{Result, SdfError};
pub use ids::{IdAllocator, LOCAL_ID_CAP};
pub use irq::{Irq, TriggerMode};
pub use memory::{Map, MapPerms, MemoryRegion, MrHandle, PAGE_SIZE};
pub use pd::{ChildPd, PdHandle, ProtectionDomain};
pub use render::SystemDocument;
pub use store::Handle;
pub use system::SystemDescription;
pub use vm::{Vcpu, VirtualMachine, VmHandle};

use serde::{Deserialize, Serialize};

/// Target instruction-set architecture for a generated system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    /// 32-bit Arm.
    Aarch32,
    /// 64-bit Arm.
    Aarch64,
    /// 32-bit RISC-V.
    Riscv32,
    /// 64-bit RISC-V.
    Riscv64,
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X86_64,
}

impl Arch {
    /// Returns `true` for 64-bit targets.
    #[must_use]
    pub const fn is_64_bit(self) -> bool {
        matches!(self, Self::Aarch64 | Self::Riscv64 | Self::X86_64)
    }
}
